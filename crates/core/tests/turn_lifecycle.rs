use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{
    AssistantBackend, AssistantConfig, ConversationThread, Message, PollPolicy, Role,
    RunSnapshot, RunStatus, Session, ToolCall, ToolError, ToolOutput, ToolOutputBatch,
    ToolRegistry, ToolSchema, TurnError, ValidationError, typed,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Backend that replays a fixed sequence of run snapshots.
///
/// `create_run`, `get_run` and `submit_tool_outputs` each consume the next
/// snapshot; the last one repeats forever. Reaching `completed` posts
/// `reply` as an assistant message on the remote thread.
#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<VecDeque<RunSnapshot>>,
    reply: Mutex<Option<String>>,
    remote_messages: Mutex<Vec<Message>>,
    submissions: Mutex<Vec<Vec<ToolOutput>>>,
    created_runs: Mutex<usize>,
    created_messages: Mutex<usize>,
    active_run: Mutex<Option<String>>,
    overlapping_runs: Mutex<usize>,
    observed: Mutex<Vec<RunStatus>>,
}

impl ScriptedBackend {
    fn new(script: Vec<RunSnapshot>, reply: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            reply: Mutex::new(Some(reply.to_string())),
            ..Default::default()
        })
    }

    fn next(&self) -> RunSnapshot {
        let mut script = self.script.lock();
        let snapshot = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().expect("script must not be empty")
        };
        self.observed.lock().push(snapshot.status);
        if snapshot.status.is_terminal() {
            *self.active_run.lock() = None;
        }
        if snapshot.status == RunStatus::Completed {
            if let Some(reply) = self.reply.lock().take() {
                let id = format!("msg_{}", self.remote_messages.lock().len() + 1);
                self.remote_messages
                    .lock()
                    .push(Message::new(Role::Assistant, reply).with_id(id));
            }
        }
        snapshot
    }
}

#[async_trait]
impl AssistantBackend for ScriptedBackend {
    async fn create_thread(&self) -> Result<String, TurnError> {
        Ok("thread_test".into())
    }

    async fn create_message(
        &self,
        _thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, TurnError> {
        *self.created_messages.lock() += 1;
        let id = format!("msg_{}", self.remote_messages.lock().len() + 1);
        let message = Message::new(role, content).with_id(id);
        self.remote_messages.lock().push(message.clone());
        Ok(message)
    }

    async fn create_run(
        &self,
        _thread_id: &str,
        _assistant: &AssistantConfig,
        _tools: &[ToolSchema],
    ) -> Result<RunSnapshot, TurnError> {
        *self.created_runs.lock() += 1;
        let snapshot = self.next();
        let mut active = self.active_run.lock();
        if active.is_some() {
            *self.overlapping_runs.lock() += 1;
        }
        if !snapshot.status.is_terminal() {
            *active = Some(snapshot.id.clone());
        }
        Ok(snapshot)
    }

    async fn get_run(&self, _thread_id: &str, _run_id: &str) -> Result<RunSnapshot, TurnError> {
        Ok(self.next())
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &str,
        _run_id: &str,
        outputs: &ToolOutputBatch,
    ) -> Result<RunSnapshot, TurnError> {
        self.submissions.lock().push(outputs.outputs().to_vec());
        Ok(self.next())
    }

    async fn latest_assistant_message(&self, _thread_id: &str) -> Result<Option<Message>, TurnError> {
        Ok(self
            .remote_messages
            .lock()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .cloned())
    }
}

#[derive(Deserialize)]
struct GetEventsArgs {
    days: Option<u32>,
}

fn calendar_registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::builder()
        .register(
            ToolSchema::new(
                "get_events",
                "Get the user's calendar events",
                json!({
                    "type": "object",
                    "properties": { "days": { "type": "integer" } }
                }),
            ),
            typed(|args: GetEventsArgs| async move {
                Ok(json!([{
                    "summary": "Dentist",
                    "start": "2026-10-20T09:00:00Z",
                    "days": args.days.unwrap_or(7)
                }]))
            }),
        )
        .register(
            ToolSchema::new(
                "delete_event",
                "Delete a calendar event",
                json!({
                    "type": "object",
                    "properties": { "event_id": { "type": "string" } },
                    "required": ["event_id"]
                }),
            ),
            typed(|args: serde_json::Value| async move {
                Err::<serde_json::Value, _>(ToolError::failed(format!(
                    "event {} not found",
                    args["event_id"]
                )))
            }),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

fn session(backend: Arc<ScriptedBackend>) -> Session {
    Session::new(
        backend,
        AssistantConfig::new("asst_test"),
        calendar_registry(),
        PollPolicy {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        },
    )
}

fn run(status: RunStatus) -> RunSnapshot {
    RunSnapshot::new("run_1", status)
}

#[tokio::test(start_paused = true)]
async fn test_calendar_question_round_trips_through_tool() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::Queued),
            run(RunStatus::InProgress),
            run(RunStatus::RequiresAction).with_tool_calls(vec![ToolCall::new(
                "call_1",
                "get_events",
                r#"{"days": 7}"#,
            )]),
            run(RunStatus::Queued),
            run(RunStatus::Completed),
        ],
        "You have a dentist appointment on Tuesday.",
    );
    let session = session(backend.clone());
    let thread = session.create_thread().await.unwrap();

    let reply = session
        .submit_turn(&thread, "What's on my calendar this week?")
        .await
        .unwrap();

    assert_eq!(reply, "You have a dentist appointment on Tuesday.");
    assert_eq!(
        *backend.observed.lock(),
        vec![
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::RequiresAction,
            RunStatus::Queued,
            RunStatus::Completed,
        ]
    );

    let submissions = backend.submissions.lock();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0][0].tool_call_id, "call_1");
    assert!(submissions[0][0].output.contains("Dentist"));

    let history = thread.history().snapshot();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, reply);
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_surfaces_remote_reason() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::Queued),
            run(RunStatus::Failed).with_error("rate_limited"),
        ],
        "never delivered",
    );
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    let err = session.submit_turn(&thread, "Hello?").await.unwrap_err();
    match &err {
        TurnError::RemoteFailure { status, reason } => {
            assert_eq!(*status, RunStatus::Failed);
            assert_eq!(reason, "rate_limited");
        }
        other => panic!("expected RemoteFailure, got {other:?}"),
    }
    assert_eq!(err.user_message(), parley_core::FALLBACK_REPLY);
    assert_eq!(thread.history().count_role(Role::User), 1);
    assert_eq!(thread.history().count_role(Role::Assistant), 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_calls_are_answered_in_one_batch() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::RequiresAction).with_tool_calls(vec![
                ToolCall::new("call_a", "get_events", "{}"),
                ToolCall::new("call_b", "delete_event", r#"{"event_id": "evt_9"}"#),
            ]),
            run(RunStatus::Completed),
        ],
        "Done.",
    );
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    assert_eq!(session.submit_turn(&thread, "Clean up my week").await.unwrap(), "Done.");

    let submissions = backend.submissions.lock();
    assert_eq!(submissions.len(), 1);
    let ids: Vec<&str> = submissions[0].iter().map(|o| o.tool_call_id.as_str()).collect();
    assert_eq!(ids, vec!["call_a", "call_b"]);
    // The failing tool becomes an error payload rather than aborting the turn.
    assert_eq!(submissions[0][1].output, r#"{"error":"event \"evt_9\" not found"}"#);
}

#[tokio::test]
async fn test_partial_outputs_are_rejected_before_submission() {
    let backend = ScriptedBackend::new(vec![run(RunStatus::Completed)], "unused");
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");
    let pending = run(RunStatus::RequiresAction).with_tool_calls(vec![
        ToolCall::new("call_a", "get_events", "{}"),
        ToolCall::new("call_b", "get_events", "{}"),
    ]);

    let only_one = vec![ToolOutput {
        tool_call_id: "call_a".into(),
        output: "[]".into(),
    }];
    let err = session
        .submit_tool_outputs(&thread, &pending, only_one)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TurnError::Validation(ValidationError::MissingToolOutputs(ref missing)) if missing == &vec!["call_b".to_string()]
    ));

    let mismatched = vec![
        ToolOutput {
            tool_call_id: "call_a".into(),
            output: "[]".into(),
        },
        ToolOutput {
            tool_call_id: "call_z".into(),
            output: "[]".into(),
        },
    ];
    let err = session
        .submit_tool_outputs(&thread, &pending, mismatched)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TurnError::Validation(ValidationError::UnknownToolCallId(ref id)) if id == "call_z"
    ));

    assert!(backend.submissions.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_gets_error_output_and_turn_continues() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::RequiresAction)
                .with_tool_calls(vec![ToolCall::new("call_1", "book_flight", "{}")]),
            run(RunStatus::Completed),
        ],
        "I can't book flights.",
    );
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    let reply = session.submit_turn(&thread, "Book me a flight").await.unwrap();
    assert_eq!(reply, "I can't book flights.");
    assert_eq!(
        backend.submissions.lock()[0][0].output,
        r#"{"error":"Unknown tool 'book_flight'"}"#
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_turns_on_one_thread_are_rejected() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::Queued),
            run(RunStatus::InProgress),
            run(RunStatus::Completed),
        ],
        "First reply.",
    );
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    let (first, second) = tokio::join!(
        session.submit_turn(&thread, "first"),
        session.submit_turn(&thread, "second"),
    );

    assert_eq!(first.unwrap(), "First reply.");
    assert!(matches!(
        second,
        Err(TurnError::Validation(ValidationError::ThreadBusy(ref id))) if id == "thread_test"
    ));
    assert_eq!(*backend.created_runs.lock(), 1);
    assert_eq!(*backend.overlapping_runs.lock(), 0);
    assert!(!thread.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_two_handles_for_one_thread_id_are_exclusive() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::Queued),
            run(RunStatus::InProgress),
            run(RunStatus::Completed),
        ],
        "First reply.",
    );
    let session = session(backend.clone());
    let other = session.clone();
    let first_handle = ConversationThread::resume("thread_test");
    let second_handle = ConversationThread::resume("thread_test");

    let (first, second) = tokio::join!(
        session.submit_turn(&first_handle, "first"),
        other.submit_turn(&second_handle, "second"),
    );

    assert_eq!(first.unwrap(), "First reply.");
    assert!(matches!(
        second,
        Err(TurnError::Validation(ValidationError::ThreadBusy(ref id))) if id == "thread_test"
    ));
    assert_eq!(*backend.created_runs.lock(), 1);
    assert_eq!(*backend.created_messages.lock(), 1);
    assert_eq!(*backend.overlapping_runs.lock(), 0);
    assert!(!session.is_thread_busy("thread_test"));
    assert!(!other.is_thread_busy("thread_test"));
}

#[tokio::test(start_paused = true)]
async fn test_sequential_turns_never_overlap_runs() {
    let backend = ScriptedBackend::new(vec![run(RunStatus::Queued), run(RunStatus::Completed)], "ok");
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    for text in ["one", "two", "three"] {
        *backend.script.lock() = vec![run(RunStatus::Queued), run(RunStatus::Completed)].into();
        *backend.reply.lock() = Some(format!("reply to {text}"));
        assert_eq!(
            session.submit_turn(&thread, text).await.unwrap(),
            format!("reply to {text}")
        );
    }
    assert_eq!(*backend.created_runs.lock(), 3);
    assert_eq!(*backend.overlapping_runs.lock(), 0);
    assert_eq!(thread.history().len(), 6);
}

#[tokio::test]
async fn test_resuming_a_completed_run_is_idempotent() {
    let backend = ScriptedBackend::new(vec![run(RunStatus::Completed)], "Already answered.");
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    let first = session.resume_run(&thread, "run_1").await.unwrap();
    let second = session.resume_run(&thread, "run_1").await.unwrap();

    assert_eq!(first, "Already answered.");
    assert_eq!(first, second);
    assert_eq!(*backend.created_runs.lock(), 0);
    assert_eq!(*backend.created_messages.lock(), 0);
    assert_eq!(thread.history().count_role(Role::Assistant), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_waiting_on_tools_is_resumable() {
    let backend = ScriptedBackend::new(
        vec![
            run(RunStatus::RequiresAction)
                .with_tool_calls(vec![ToolCall::new("call_7", "get_events", "{}")]),
            run(RunStatus::InProgress),
            run(RunStatus::Completed),
        ],
        "Recovered.",
    );
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    assert_eq!(session.resume_run(&thread, "run_1").await.unwrap(), "Recovered.");
    assert_eq!(backend.submissions.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_answered_calls_are_not_dispatched_twice() {
    let pending = run(RunStatus::RequiresAction)
        .with_tool_calls(vec![ToolCall::new("call_1", "get_events", "{}")]);
    let backend = ScriptedBackend::new(
        vec![pending.clone(), pending.clone(), pending, run(RunStatus::Completed)],
        "Once.",
    );
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    assert_eq!(session.submit_turn(&thread, "hi").await.unwrap(), "Once.");
    assert_eq!(backend.submissions.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_run_times_out() {
    let backend = ScriptedBackend::new(vec![run(RunStatus::InProgress)], "never");
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    let err = session.submit_turn(&thread, "hello").await.unwrap_err();
    assert!(matches!(err, TurnError::Timeout(d) if d == Duration::from_secs(30)));
    assert!(!thread.is_busy());
}

#[tokio::test]
async fn test_empty_input_is_rejected_before_any_call() {
    let backend = ScriptedBackend::new(vec![run(RunStatus::Completed)], "unused");
    let session = session(backend.clone());
    let thread = ConversationThread::resume("thread_test");

    let err = session.submit_turn(&thread, "   ").await.unwrap_err();
    assert!(matches!(err, TurnError::Validation(ValidationError::EmptyInput)));
    assert_eq!(*backend.created_messages.lock(), 0);
    assert_eq!(*backend.created_runs.lock(), 0);
    assert!(thread.history().is_empty());
}
