//! Page controllers.
//!
//! A page owns one [`Collection`] and is the only code that mutates it. Gateway calls that
//! complete in the background and change notifications are both consumed through
//! [`PageCore::next_event`], so every mutation happens on the page's own task. After
//! `teardown()` the subscription is released, pending calls are aborted and nothing further is
//! applied.

pub mod calendar;
pub mod leads;

pub use calendar::Calendar;
pub use leads::LeadBoard;

use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};

use crate::backend::Backend;
use crate::errors::{ErrorSurface, SyncError, UserAction};
use crate::gateway::Gateway;
use crate::models::Record;
use crate::realtime::{Change, Delivery, Subscription};
use crate::reconciler::{Collection, OpId};

/// Something the page's owner should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// The row was inserted, replaced or removed
    Changed { id: String },
    /// A background edit failed and the row is back to its previous state
    Reverted { id: String },
    /// The collection was re-listed after missed notifications
    Reloaded,
    /// A failure the page now shows
    Error(ErrorSurface),
    /// The change stream ended; `reload()` reconnects
    Disconnected,
    /// The page was torn down
    Closed,
}

enum Settled<R> {
    Updated {
        op: OpId,
        id: String,
        action: UserAction,
        result: Result<R, SyncError>,
    },
    Deleted {
        op: OpId,
        id: String,
        action: UserAction,
        result: Result<(), SyncError>,
    },
}

enum Wake<R> {
    Settled(Result<Settled<R>, JoinError>),
    Delivery(Delivery<R>),
}

/// Collection, subscription and pending gateway calls of one page.
pub struct PageCore<R: Record> {
    backend: Arc<dyn Backend>,
    gateway: Gateway<R>,
    collection: Collection<R>,
    subscription: Option<Subscription<R>>,
    pending: JoinSet<Settled<R>>,
    error: Option<ErrorSurface>,
    load_action: UserAction,
    alive: bool,
}

impl<R: Record> PageCore<R> {
    /// Subscribe, then list. A failed listing leaves the page open with an error banner.
    pub async fn open(backend: Arc<dyn Backend>, load_action: UserAction) -> Result<Self, SyncError> {
        let subscription = Subscription::open(backend.clone()).await?;

        let mut page = Self {
            gateway: Gateway::new(backend.clone()),
            backend,
            collection: Collection::new(),
            subscription: Some(subscription),
            pending: JoinSet::new(),
            error: None,
            load_action,
            alive: true,
        };
        page.load().await;
        Ok(page)
    }

    pub fn collection(&self) -> &Collection<R> {
        &self.collection
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.collection.get(id)
    }

    pub fn error(&self) -> Option<&ErrorSurface> {
        self.error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_connected(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.is_active())
    }

    /// Re-list the collection, reconnecting the change stream first if it ended.
    pub async fn reload(&mut self) -> Result<(), ErrorSurface> {
        self.ensure_alive()?;

        if !self.is_connected() {
            match Subscription::open(self.backend.clone()).await {
                Ok(subscription) => self.subscription = Some(subscription),
                Err(e) => return Err(self.fail(&e, self.load_action)),
            }
        }

        if self.load().await {
            Ok(())
        } else {
            Err(self.error.clone().unwrap_or(ErrorSurface::Silent))
        }
    }

    /// Create a row. It is shown once the gateway returns it.
    pub async fn create(&mut self, draft: &R::Draft, action: UserAction) -> Result<R, ErrorSurface> {
        self.ensure_alive()?;

        match self.gateway.create(draft).await {
            Ok(record) => {
                if self.alive {
                    self.collection.merge(record.clone());
                }
                Ok(record)
            }
            Err(e) => Err(self.fail(&e, action)),
        }
    }

    /// Apply `patch` now and wait for the gateway. On failure the row is restored and the error
    /// returned, so a dialog can stay open.
    pub async fn save(&mut self, id: &str, patch: R::Patch, action: UserAction) -> Result<R, ErrorSurface> {
        self.ensure_alive()?;
        self.check_patch(id, &patch, action)?;

        let op = self
            .collection
            .begin_update(id, &patch)
            .ok_or(ErrorSurface::Silent)?;
        let result = self.gateway.update(id, &patch).await;
        self.settle_update(op, id, action, result)
    }

    /// Apply `patch` now; the gateway result arrives through `next_event`.
    pub fn update_in_background(
        &mut self,
        id: &str,
        patch: R::Patch,
        action: UserAction,
    ) -> Result<(), ErrorSurface> {
        self.ensure_alive()?;
        self.check_patch(id, &patch, action)?;

        let op = self
            .collection
            .begin_update(id, &patch)
            .ok_or(ErrorSurface::Silent)?;

        let gateway = self.gateway.clone();
        let id = id.to_string();
        self.pending.spawn(async move {
            let result = gateway.update(&id, &patch).await;
            Settled::Updated {
                op,
                id,
                action,
                result,
            }
        });
        Ok(())
    }

    /// Hide the row now and wait for the gateway.
    pub async fn delete(&mut self, id: &str, action: UserAction) -> Result<(), ErrorSurface> {
        self.ensure_alive()?;

        let Some(op) = self.collection.begin_delete(id) else {
            return Ok(());
        };
        let result = self.gateway.delete(id).await;
        self.settle_delete(op, id, action, result)
    }

    /// Hide the row now; the gateway result arrives through `next_event`.
    pub fn delete_in_background(&mut self, id: &str, action: UserAction) -> Result<(), ErrorSurface> {
        self.ensure_alive()?;

        let Some(op) = self.collection.begin_delete(id) else {
            return Ok(());
        };

        let gateway = self.gateway.clone();
        let id = id.to_string();
        self.pending.spawn(async move {
            let result = gateway.delete(&id).await;
            Settled::Deleted {
                op,
                id,
                action,
                result,
            }
        });
        Ok(())
    }

    /// Wait for the next notification or background result and apply it.
    pub async fn next_event(&mut self) -> PageEvent {
        loop {
            if !self.alive {
                return PageEvent::Closed;
            }
            if self.subscription.is_none() && self.pending.is_empty() {
                return PageEvent::Disconnected;
            }

            let wake = tokio::select! {
                Some(joined) = self.pending.join_next(), if !self.pending.is_empty() => Wake::Settled(joined),
                delivery = next_delivery(&mut self.subscription) => Wake::Delivery(delivery),
            };

            if let Some(event) = self.handle(wake).await {
                return event;
            }
        }
    }

    /// Release the subscription and drop every pending call. Idempotent.
    pub fn teardown(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        self.pending.abort_all();
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        tracing::info!(table = %R::TABLE, "Page torn down");
    }

    // ==================== INTERNALS ====================

    async fn handle(&mut self, wake: Wake<R>) -> Option<PageEvent> {
        match wake {
            Wake::Settled(Ok(Settled::Updated {
                op,
                id,
                action,
                result,
            })) => match self.settle_update(op, &id, action, result) {
                Ok(_) | Err(ErrorSurface::Silent) => Some(PageEvent::Changed { id }),
                Err(_) => Some(PageEvent::Reverted { id }),
            },
            Wake::Settled(Ok(Settled::Deleted {
                op,
                id,
                action,
                result,
            })) => match self.settle_delete(op, &id, action, result) {
                Ok(()) | Err(ErrorSurface::Silent) => None,
                Err(_) => Some(PageEvent::Reverted { id }),
            },
            Wake::Settled(Err(e)) => {
                if !e.is_cancelled() {
                    tracing::warn!(table = %R::TABLE, error = %e, "Gateway task failed");
                }
                None
            }
            Wake::Delivery(Delivery::Change(change)) => {
                let id = change.id().to_string();
                let outcome = match change {
                    Change::Insert(record) | Change::Update(record) => self.collection.merge(record),
                    Change::Delete { id } => self.collection.remove(&id),
                };
                tracing::debug!(table = %R::TABLE, id = %id, outcome = ?outcome, "Applied change");
                outcome.changed().then_some(PageEvent::Changed { id })
            }
            Wake::Delivery(Delivery::Lagged(missed)) => {
                tracing::info!(table = %R::TABLE, missed, "Reloading after missed changes");
                if self.load().await {
                    Some(PageEvent::Reloaded)
                } else {
                    self.error.clone().map(PageEvent::Error)
                }
            }
            Wake::Delivery(Delivery::Closed) => {
                self.subscription = None;
                self.fail(
                    &SyncError::Transport("Change stream closed".to_string()),
                    self.load_action,
                );
                Some(PageEvent::Disconnected)
            }
        }
    }

    async fn load(&mut self) -> bool {
        match self.gateway.list().await {
            Ok(records) => {
                self.collection.replace_all(records);
                self.error = None;
                tracing::info!(table = %R::TABLE, count = self.collection.len(), "Loaded page");
                true
            }
            Err(e) => {
                self.fail(&e, self.load_action);
                false
            }
        }
    }

    fn settle_update(
        &mut self,
        op: OpId,
        id: &str,
        action: UserAction,
        result: Result<R, SyncError>,
    ) -> Result<R, ErrorSurface> {
        match result {
            Ok(record) => {
                self.collection.confirm_update(op, record.clone());
                Ok(record)
            }
            Err(SyncError::NotFound(_)) => {
                self.collection.remove(id);
                Err(ErrorSurface::Silent)
            }
            Err(e) => {
                self.collection.rollback_update(op, id);
                Err(self.fail(&e, action))
            }
        }
    }

    fn settle_delete(
        &mut self,
        op: OpId,
        id: &str,
        action: UserAction,
        result: Result<(), SyncError>,
    ) -> Result<(), ErrorSurface> {
        match result {
            Ok(()) | Err(SyncError::NotFound(_)) => {
                self.collection.confirm_delete(op, id);
                Ok(())
            }
            Err(e) => {
                self.collection.rollback_delete(op, id);
                Err(self.fail(&e, action))
            }
        }
    }

    /// Validate the row a patch would produce before touching the collection.
    fn check_patch(&mut self, id: &str, patch: &R::Patch, action: UserAction) -> Result<(), ErrorSurface> {
        let mut preview = self.collection.get(id).cloned().ok_or(ErrorSurface::Silent)?;
        preview.apply_patch(patch);
        preview.validate().map_err(|e| self.fail(&e, action))
    }

    /// Record a failure on the page. Inline errors belong to the open dialog.
    fn fail(&mut self, err: &SyncError, action: UserAction) -> ErrorSurface {
        let surface = err.surface(action);
        match surface {
            ErrorSurface::Silent | ErrorSurface::Inline { .. } => {}
            _ => self.error = Some(surface.clone()),
        }
        surface
    }

    fn ensure_alive(&self) -> Result<(), ErrorSurface> {
        if self.alive {
            Ok(())
        } else {
            Err(ErrorSurface::Silent)
        }
    }
}

async fn next_delivery<R: Record>(subscription: &mut Option<Subscription<R>>) -> Delivery<R> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
