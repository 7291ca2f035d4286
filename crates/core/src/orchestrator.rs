//! Poll-mode turn lifecycle.
//!
//! One call to [`Session::submit_turn`] appends the user message, creates a
//! run and drives it to a terminal status, answering any number of
//! `requires_action` steps through the [`ToolRegistry`] on the way. The only
//! suspension point between remote calls is the backoff sleep.

use crate::backend::{AssistantBackend, AssistantConfig};
use crate::backoff::{Backoff, PollPolicy};
use crate::error::{TurnError, ValidationError};
use crate::history::{ConversationHistory, Role};
use crate::run::{RunSnapshot, RunStatus, ToolOutput, ToolOutputBatch};
use crate::tools::ToolRegistry;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A remote thread plus its local history.
///
/// At most one turn may be in flight per thread; a second caller is rejected
/// instead of racing the first.
#[derive(Debug)]
pub struct ConversationThread {
    id: String,
    history: ConversationHistory,
    active: Mutex<()>,
}

impl ConversationThread {
    /// Attaches to an existing remote thread.
    pub fn resume(id: impl Into<String>) -> Self {
        Self::with_history(id, ConversationHistory::new())
    }

    pub fn with_history(id: impl Into<String>, history: ConversationHistory) -> Self {
        Self {
            id: id.into(),
            history,
            active: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn is_busy(&self) -> bool {
        self.active.try_lock().is_err()
    }

    fn claim(&self) -> Result<MutexGuard<'_, ()>, ValidationError> {
        self.active
            .try_lock()
            .map_err(|_| ValidationError::ThreadBusy(self.id.clone()))
    }
}

/// Holds a thread for one turn. Releases both the thread lock and the
/// session-wide id reservation on drop.
struct TurnClaim<'a> {
    _thread: MutexGuard<'a, ()>,
    id: &'a str,
    busy: &'a parking_lot::Mutex<HashSet<String>>,
}

impl Drop for TurnClaim<'_> {
    fn drop(&mut self) {
        self.busy.lock().remove(self.id);
    }
}

/// Everything a turn needs, passed explicitly instead of living in globals.
///
/// Clones share one set of busy thread ids, so two `ConversationThread`
/// values naming the same remote thread still cannot run turns at once.
#[derive(Clone)]
pub struct Session {
    backend: Arc<dyn AssistantBackend>,
    assistant: AssistantConfig,
    tools: Arc<ToolRegistry>,
    policy: PollPolicy,
    busy: Arc<parking_lot::Mutex<HashSet<String>>>,
}

impl Session {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        assistant: AssistantConfig,
        tools: Arc<ToolRegistry>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            backend,
            assistant,
            tools,
            policy,
            busy: Arc::default(),
        }
    }

    /// True while a turn of this session holds `thread_id`.
    pub fn is_thread_busy(&self, thread_id: &str) -> bool {
        self.busy.lock().contains(thread_id)
    }

    fn claim<'a>(&'a self, thread: &'a ConversationThread) -> Result<TurnClaim<'a>, ValidationError> {
        let guard = thread.claim()?;
        if !self.busy.lock().insert(thread.id().to_string()) {
            return Err(ValidationError::ThreadBusy(thread.id().to_string()));
        }
        Ok(TurnClaim {
            _thread: guard,
            id: thread.id(),
            busy: &self.busy,
        })
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    pub async fn create_thread(&self) -> Result<ConversationThread, TurnError> {
        let id = self.backend.create_thread().await?;
        info!(thread_id = %id, "Created thread");
        Ok(ConversationThread::resume(id))
    }

    /// Runs one conversational turn to completion and returns the reply text.
    #[instrument(name = "submit_turn", skip_all, fields(thread_id = %thread.id()))]
    pub async fn submit_turn(
        &self,
        thread: &ConversationThread,
        user_text: &str,
    ) -> Result<String, TurnError> {
        if user_text.trim().is_empty() {
            return Err(ValidationError::EmptyInput.into());
        }
        let _turn = self.claim(thread)?;
        let deadline = Instant::now() + self.policy.timeout;

        let message = self
            .bounded(deadline, self.backend.create_message(thread.id(), Role::User, user_text))
            .await?;
        thread.history.record(message);

        let run = self
            .bounded(
                deadline,
                self.backend
                    .create_run(thread.id(), &self.assistant, &self.tools.schemas()),
            )
            .await?;
        info!(run_id = %run.id, "Run created");

        self.drive(thread, run, deadline).await
    }

    /// Re-enters the state machine for a run of unknown state, e.g. after a
    /// restart. A completed run yields its reply without creating anything.
    #[instrument(name = "resume_run", skip_all, fields(thread_id = %thread.id(), %run_id))]
    pub async fn resume_run(
        &self,
        thread: &ConversationThread,
        run_id: &str,
    ) -> Result<String, TurnError> {
        let _turn = self.claim(thread)?;
        let deadline = Instant::now() + self.policy.timeout;
        let run = self
            .bounded(deadline, self.backend.get_run(thread.id(), run_id))
            .await?;
        self.drive(thread, run, deadline).await
    }

    /// Validates and submits a complete set of outputs for a pending run.
    ///
    /// A partial set, an unknown id or a duplicate is rejected before the
    /// backend is contacted, leaving the run unresumed.
    pub async fn submit_tool_outputs(
        &self,
        thread: &ConversationThread,
        run: &RunSnapshot,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunSnapshot, TurnError> {
        let _turn = self.claim(thread)?;
        let batch = ToolOutputBatch::for_run(run, outputs)?;
        self.backend
            .submit_tool_outputs(thread.id(), &run.id, &batch)
            .await
    }

    async fn drive(
        &self,
        thread: &ConversationThread,
        mut run: RunSnapshot,
        deadline: Instant,
    ) -> Result<String, TurnError> {
        let mut backoff = Backoff::from_policy(&self.policy);
        let mut answered: HashSet<String> = HashSet::new();

        loop {
            debug!(run_id = %run.id, status = %run.status, "Polled run");
            match run.status {
                RunStatus::Completed => return self.collect_reply(thread, deadline).await,
                RunStatus::Failed | RunStatus::Expired => {
                    let reason = run
                        .last_error
                        .clone()
                        .unwrap_or_else(|| run.status.to_string());
                    warn!(run_id = %run.id, status = %run.status, %reason, "Run did not complete");
                    return Err(TurnError::RemoteFailure {
                        status: run.status,
                        reason,
                    });
                }
                RunStatus::RequiresAction
                    if !run.tool_calls.iter().all(|c| answered.contains(&c.id)) =>
                {
                    info!(run_id = %run.id, calls = run.tool_calls.len(), "Run requires action");
                    let outputs = self.tools.dispatch(&run.tool_calls).await;
                    let batch = ToolOutputBatch::for_run(&run, outputs)?;
                    answered.extend(run.tool_calls.iter().map(|c| c.id.clone()));
                    run = self
                        .bounded(
                            deadline,
                            self.backend.submit_tool_outputs(thread.id(), &run.id, &batch),
                        )
                        .await?;
                    backoff.reset();
                    continue;
                }
                // Queued, in progress, or still showing calls we already answered.
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(run_id = %run.id, "Run poll timed out");
                return Err(TurnError::Timeout(self.policy.timeout));
            }
            tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
            run = self
                .bounded(deadline, self.backend.get_run(thread.id(), &run.id))
                .await?;
        }
    }

    async fn collect_reply(
        &self,
        thread: &ConversationThread,
        deadline: Instant,
    ) -> Result<String, TurnError> {
        let message = self
            .bounded(deadline, self.backend.latest_assistant_message(thread.id()))
            .await?
            .ok_or_else(|| TurnError::RemoteFailure {
                status: RunStatus::Completed,
                reason: "run completed without an assistant message".into(),
            })?;
        let text = message.content.clone();
        if thread.history.record(message) {
            info!(chars = text.len(), "Assistant reply recorded");
        }
        Ok(text)
    }

    /// Applies the turn deadline to a single remote call.
    async fn bounded<T>(
        &self,
        deadline: Instant,
        call: impl Future<Output = Result<T, TurnError>>,
    ) -> Result<T, TurnError> {
        tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| TurnError::Timeout(self.policy.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_thread_claim_is_exclusive() {
        let thread = ConversationThread::resume("thread_1");
        assert!(!thread.is_busy());

        let guard = thread.claim().unwrap();
        assert!(thread.is_busy());
        assert_eq!(
            thread.claim().unwrap_err(),
            ValidationError::ThreadBusy("thread_1".into())
        );

        drop(guard);
        assert!(!thread.is_busy());
    }
}
