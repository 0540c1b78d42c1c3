//! Shared calendar: events with a reporter filter, dialog edits and drag/resize moves.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use super::{PageCore, PageEvent};
use crate::auth::{can_mutate_event, SessionContext};
use crate::errors::{messages, ErrorSurface, SyncError, UserAction};
use crate::models::{Event, EventPatch, NewEvent, ReporterFilter, TimeRange};
use crate::reconciler::{filter, Collection};

pub struct Calendar {
    core: PageCore<Event>,
    session: Arc<SessionContext>,
    reporter: ReporterFilter,
}

impl Calendar {
    /// Open the calendar for the signed-in user.
    pub async fn open(session: Arc<SessionContext>) -> Result<Self, SyncError> {
        if !session.is_logged_in() {
            return Err(SyncError::Auth("User not authenticated".to_string()));
        }
        let core = PageCore::open(session.backend(), UserAction::LoadEvents).await?;

        Ok(Self {
            core,
            session,
            reporter: ReporterFilter::All,
        })
    }

    /// Every event, earliest first.
    pub fn events(&self) -> &Collection<Event> {
        self.core.collection()
    }

    pub fn get(&self, id: &str) -> Option<&Event> {
        self.core.get(id)
    }

    /// Where the widget should draw `id`.
    pub fn time_range(&self, id: &str) -> Option<TimeRange> {
        self.get(id).map(Event::time_range)
    }

    /// Events of the selected reporter.
    pub fn visible(&self) -> Vec<Event> {
        filter(self.core.collection().iter(), &self.reporter)
    }

    pub fn set_filter(&mut self, reporter: ReporterFilter) {
        self.reporter = reporter;
    }

    pub fn reporter_filter(&self) -> ReporterFilter {
        self.reporter
    }

    /// Dialog values for a new event on the selected day.
    pub fn form_for_day<Tz: TimeZone>(&self, day: NaiveDate, tz: &Tz) -> Result<NewEvent, SyncError> {
        NewEvent::for_day(day, tz)
    }

    /// Dialog save. `editing` is the event being edited, `None` for a new event.
    pub async fn save(&mut self, editing: Option<&str>, form: NewEvent) -> Result<Event, ErrorSurface> {
        self.authorize(editing)?;
        let form = form.normalized();

        match editing {
            None => self.core.create(&form, UserAction::SaveEvent).await,
            Some(id) => {
                self.core
                    .save(id, EventPatch::from_form(form), UserAction::SaveEvent)
                    .await
            }
        }
    }

    /// Delete from the dialog; it closes once this returns `Ok`.
    pub async fn delete(&mut self, id: &str) -> Result<(), ErrorSurface> {
        self.authorize(Some(id))?;
        self.core.delete(id, UserAction::DeleteEvent).await
    }

    /// Drag or resize. The event moves at once; if the backend refuses, `next_event` yields
    /// `Reverted` and [`Calendar::time_range`] gives the position to snap back to.
    pub fn move_event(
        &mut self,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), ErrorSurface> {
        self.authorize(Some(id))?;
        let range = TimeRange::new(start, end).map_err(|e| e.surface(UserAction::MoveEvent))?;
        self.core
            .update_in_background(id, EventPatch::reschedule(range), UserAction::MoveEvent)
    }

    pub async fn next_event(&mut self) -> PageEvent {
        self.core.next_event().await
    }

    /// The banner's reload action.
    pub async fn reload(&mut self) -> Result<(), ErrorSurface> {
        self.core.reload().await
    }

    pub fn error(&self) -> Option<&ErrorSurface> {
        self.core.error()
    }

    pub fn clear_error(&mut self) {
        self.core.clear_error();
    }

    pub fn teardown(&mut self) {
        self.core.teardown();
    }

    fn authorize(&self, id: Option<&str>) -> Result<(), ErrorSurface> {
        let user = self.session.current_user();
        let allowed = match id {
            Some(id) => {
                let event = self.get(id).ok_or(ErrorSurface::Silent)?;
                can_mutate_event(event, user.as_ref())
            }
            None => user.is_some(),
        };
        if allowed {
            return Ok(());
        }
        Err(ErrorSurface::AccessDenied {
            message: messages::ACCESS_DENIED.to_string(),
        })
    }
}

impl Drop for Calendar {
    fn drop(&mut self) {
        self.teardown();
    }
}
