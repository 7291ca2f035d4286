//! Calendar tools exposed to the assistant, backed by an in-memory store.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use parking_lot::RwLock;
use parley_core::{ToolError, ToolRegistry, ToolSchema, ValidationError, typed};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

const DEFAULT_DAYS: u32 = 7;
const DEFAULT_MAX_RESULTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Default)]
struct Calendar {
    events: Vec<CalendarEvent>,
    next_id: u64,
}

#[derive(Default)]
pub struct CalendarStore {
    inner: RwLock<Calendar>,
}

impl CalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        summary: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        description: Option<String>,
        location: Option<String>,
    ) -> CalendarEvent {
        let mut calendar = self.inner.write();
        calendar.next_id += 1;
        let event = CalendarEvent {
            id: format!("evt_{}", calendar.next_id),
            summary: summary.into(),
            start,
            end,
            description,
            location,
        };
        calendar.events.push(event.clone());
        event
    }

    /// Events starting in `[from, from + days)`, earliest first. `None`
    /// when the window end is not a representable date.
    pub fn upcoming(
        &self,
        from: DateTime<Utc>,
        days: u32,
        max_results: usize,
    ) -> Option<Vec<CalendarEvent>> {
        let until = Duration::try_days(i64::from(days)).and_then(|d| from.checked_add_signed(d))?;
        let mut events: Vec<CalendarEvent> = self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| e.start >= from && e.start < until)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start);
        events.truncate(max_results);
        Some(events)
    }

    pub fn remove(&self, id: &str) -> Option<CalendarEvent> {
        let mut calendar = self.inner.write();
        let index = calendar.events.iter().position(|e| e.id == id)?;
        Some(calendar.events.remove(index))
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetEventsArgs {
    /// Number of days to fetch events for
    pub days: Option<u32>,
    /// Maximum number of events to return
    pub max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateEventArgs {
    /// Title of the event
    pub summary: String,
    /// Start time, RFC 3339 or "YYYY-MM-DD HH:MM" (UTC)
    pub start_time: String,
    /// End time, RFC 3339 or "YYYY-MM-DD HH:MM" (UTC)
    pub end_time: String,
    /// Description of the event
    pub description: Option<String>,
    /// Location of the event
    pub location: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteEventArgs {
    /// ID of the event to delete
    pub event_id: String,
}

fn parse_time(field: &str, raw: &str) -> Result<DateTime<Utc>, ToolError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ToolError::InvalidArguments(format!("{} '{}' is not a date-time", field, raw)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::failed(e.to_string()))
}

/// Builds the registry declaring `get_events`, `create_event` and
/// `delete_event` over `store`.
pub fn calendar_registry(store: Arc<CalendarStore>) -> Result<ToolRegistry, ValidationError> {
    let list_store = store.clone();
    let create_store = store.clone();
    let delete_store = store;

    ToolRegistry::builder()
        .register(
            ToolSchema::for_args::<GetEventsArgs>("get_events", "Get the user's calendar events"),
            typed(move |args: GetEventsArgs| {
                let store = list_store.clone();
                async move {
                    let days = args.days.unwrap_or(DEFAULT_DAYS);
                    let max = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS) as usize;
                    let events = store.upcoming(Utc::now(), days, max).ok_or_else(|| {
                        ToolError::InvalidArguments(format!("days {} is out of range", days))
                    })?;
                    info!(days, found = events.len(), "Listed calendar events");
                    Ok::<_, ToolError>(json!({ "events": to_value(&events)? }))
                }
            }),
        )
        .register(
            ToolSchema::for_args::<CreateEventArgs>("create_event", "Create a new calendar event"),
            typed(move |args: CreateEventArgs| {
                let store = create_store.clone();
                async move {
                    let start = parse_time("start_time", &args.start_time)?;
                    let end = parse_time("end_time", &args.end_time)?;
                    if end <= start {
                        return Err(ToolError::InvalidArguments(
                            "end_time must be after start_time".into(),
                        ));
                    }
                    let event = store.insert(args.summary, start, end, args.description, args.location);
                    info!(event_id = %event.id, "Created calendar event");
                    to_value(&event)
                }
            }),
        )
        .register(
            ToolSchema::for_args::<DeleteEventArgs>("delete_event", "Delete a calendar event"),
            typed(move |args: DeleteEventArgs| {
                let store = delete_store.clone();
                async move {
                    match store.remove(&args.event_id) {
                        Some(event) => {
                            info!(event_id = %event.id, "Deleted calendar event");
                            Ok(json!({ "deleted": event.id }))
                        }
                        None => Err(ToolError::failed(format!(
                            "event \"{}\" not found",
                            args.event_id
                        ))),
                    }
                }
            }),
        )
        .build()
}
