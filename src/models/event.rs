//! Calendar event model.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{Record, Reporter, SortKey, Table};
use crate::errors::SyncError;

/// Start and end instants of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SyncError> {
        if end < start {
            return Err(SyncError::Validation(
                "End time must not be before start time".to_string(),
            ));
        }
        Ok(Self { start, end })
    }
}

/// A calendar event row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub reporter: Reporter,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl Event {
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }

    /// Form values for editing this event.
    pub fn to_form(&self) -> NewEvent {
        NewEvent {
            title: self.title.clone(),
            start: self.start,
            end: self.end,
            location: self.location.clone(),
            note: self.note.clone(),
            reporter: self.reporter,
        }
    }
}

/// Fields supplied when creating an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location: Option<String>,
    pub note: Option<String>,
    pub reporter: Reporter,
}

impl NewEvent {
    /// Blank event on `day`, 09:00 to 10:00 wall-clock time in `tz`.
    pub fn for_day<Tz: TimeZone>(day: NaiveDate, tz: &Tz) -> Result<Self, SyncError> {
        let at = |hour: u32| {
            let wall = day.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default());
            tz.from_local_datetime(&wall)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| SyncError::Validation(format!("{} does not exist locally", wall)))
        };

        Ok(Self {
            title: String::new(),
            start: at(9)?,
            end: at(10)?,
            location: None,
            note: None,
            reporter: Reporter::default(),
        })
    }

    /// Trim text and store empty location/note as absent.
    pub fn normalized(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.location = blank_to_none(self.location);
        self.note = blank_to_none(self.note);
        self
    }
}

/// Partial update of an event. `Some(None)` clears an optional column.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct EventPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter: Option<Reporter>,
}

impl EventPatch {
    /// Patch produced by dragging or resizing an event.
    pub fn reschedule(range: TimeRange) -> Self {
        Self {
            start: Some(range.start),
            end: Some(range.end),
            ..Self::default()
        }
    }

    /// Patch that overwrites every editable field, as a dialog save does.
    pub fn from_form(form: NewEvent) -> Self {
        let form = form.normalized();
        Self {
            title: Some(form.title),
            start: Some(form.start),
            end: Some(form.end),
            location: Some(form.location),
            note: Some(form.note),
            reporter: Some(form.reporter),
        }
    }
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Record for Event {
    type Draft = NewEvent;
    type Patch = EventPatch;

    const TABLE: Table = Table::Events;
    const SORT: SortKey = SortKey {
        column: "start",
        ascending: true,
    };

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn created_by(&self) -> &str {
        &self.created_by
    }

    fn apply_patch(&mut self, patch: &EventPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(start) = patch.start {
            self.start = start;
        }
        if let Some(end) = patch.end {
            self.end = end;
        }
        if let Some(location) = &patch.location {
            self.location = location.clone();
        }
        if let Some(note) = &patch.note {
            self.note = note.clone();
        }
        if let Some(reporter) = patch.reporter {
            self.reporter = reporter;
        }
    }

    /// Earliest start first.
    fn sort_cmp(a: &Self, b: &Self) -> Ordering {
        a.start.cmp(&b.start)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.title.trim().is_empty() {
            return Err(SyncError::Validation("Title is required".to_string()));
        }
        TimeRange::new(self.start, self.end).map(|_| ())
    }

    fn preview(draft: &NewEvent) -> Self {
        let now = Utc::now();
        Event {
            id: String::new(),
            title: draft.title.clone(),
            start: draft.start,
            end: draft.end,
            location: draft.location.clone(),
            note: draft.note.clone(),
            reporter: draft.reporter,
            created_at: now,
            updated_at: now,
            created_by: String::new(),
        }
    }
}
