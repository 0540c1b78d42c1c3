//! Change notification bridge.
//!
//! Turns the backend's raw per-table change stream into typed insert/update/delete
//! notifications. A [`Subscription`] is pulled by its owner; [`subscribe`] drives a
//! [`ChangeHandler`] from a background task instead. Either way the underlying listener is
//! released exactly once, on `unsubscribe()` or on drop.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::backend::{Backend, ChangeKind, RawChange};
use crate::errors::SyncError;
use crate::models::{Record, Table};

/// A typed change to one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<R> {
    Insert(R),
    Update(R),
    Delete { id: String },
}

impl<R: Record> Change<R> {
    pub fn id(&self) -> &str {
        match self {
            Change::Insert(record) | Change::Update(record) => record.id(),
            Change::Delete { id } => id,
        }
    }
}

/// Decode a raw change for `R`; `Ok(None)` for changes to other tables.
pub fn decode_change<R: Record>(raw: RawChange) -> Result<Option<Change<R>>, SyncError> {
    if raw.table != R::TABLE {
        return Ok(None);
    }

    let change = match raw.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let row = raw.new.ok_or_else(|| {
                SyncError::Internal(format!("{} change without a row", R::TABLE))
            })?;
            let record: R = serde_json::from_value(row)?;
            if raw.kind == ChangeKind::Insert {
                Change::Insert(record)
            } else {
                Change::Update(record)
            }
        }
        ChangeKind::Delete => {
            let id = raw
                .old
                .as_ref()
                .and_then(|old| old.get("id"))
                .and_then(|id| id.as_str())
                .ok_or_else(|| {
                    SyncError::Internal(format!("{} delete without a primary key", R::TABLE))
                })?;
            Change::Delete { id: id.to_string() }
        }
    };
    Ok(Some(change))
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<R> {
    Change(Change<R>),
    /// `n` notifications were dropped because the buffer overflowed
    Lagged(u64),
    /// The stream ended; nothing more will arrive
    Closed,
}

/// Holds one backend listener and gives it back exactly once.
struct Lease {
    backend: Arc<dyn Backend>,
    table: Table,
    generation: u64,
    released: AtomicBool,
}

impl Lease {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.backend.release_changes(self.table, self.generation);
        tracing::info!(table = %self.table, "Unsubscribed from changes");
        true
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Pull-based typed change stream for one record kind.
pub struct Subscription<R: Record> {
    rx: broadcast::Receiver<RawChange>,
    lease: Arc<Lease>,
    closed: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Subscription<R> {
    pub async fn open(backend: Arc<dyn Backend>) -> Result<Self, SyncError> {
        let feed = backend.subscribe_changes(R::TABLE).await?;
        tracing::info!(table = %R::TABLE, generation = feed.generation, "Subscribed to changes");

        Ok(Self {
            rx: feed.receiver,
            lease: Arc::new(Lease {
                backend,
                table: R::TABLE,
                generation: feed.generation,
                released: AtomicBool::new(false),
            }),
            closed: false,
            _record: PhantomData,
        })
    }

    /// Next delivery. Undecodable notifications are logged and skipped.
    pub async fn recv(&mut self) -> Delivery<R> {
        loop {
            if self.closed || self.lease.is_released() {
                return Delivery::Closed;
            }

            match self.rx.recv().await {
                Ok(raw) => match decode_change::<R>(raw) {
                    Ok(Some(change)) => return Delivery::Change(change),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(table = %R::TABLE, error = %e, "Dropping undecodable change");
                    }
                },
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(table = %R::TABLE, missed, "Change stream lagged");
                    return Delivery::Lagged(missed);
                }
                Err(RecvError::Closed) => {
                    tracing::warn!(table = %R::TABLE, "Change stream closed");
                    self.closed = true;
                    return Delivery::Closed;
                }
            }
        }
    }

    /// Stop delivery and release the listener. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.closed = true;
        self.lease.release();
    }

    pub fn is_active(&self) -> bool {
        !self.closed && !self.lease.is_released()
    }
}

impl<R: Record> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.lease.release();
    }
}

/// Callbacks for a pushed subscription.
///
/// Returning an error (or panicking) only drops that one notification; the subscription stays
/// active.
pub trait ChangeHandler<R>: Send + 'static {
    fn on_insert(&mut self, record: R) -> Result<(), SyncError>;
    fn on_update(&mut self, record: R) -> Result<(), SyncError>;
    fn on_delete(&mut self, id: &str) -> Result<(), SyncError>;

    /// Some notifications were missed.
    fn on_lagged(&mut self, missed: u64) {
        let _ = missed;
    }
}

/// Run one change through `handler`, containing any failure.
pub fn dispatch<R: Record, H: ChangeHandler<R> + ?Sized>(handler: &mut H, change: Change<R>) {
    let id = change.id().to_string();
    let outcome = catch_unwind(AssertUnwindSafe(|| match change {
        Change::Insert(record) => handler.on_insert(record),
        Change::Update(record) => handler.on_update(record),
        Change::Delete { id } => handler.on_delete(&id),
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(table = %R::TABLE, id = %id, error = %e, "Change handler failed");
        }
        Err(_) => {
            tracing::warn!(table = %R::TABLE, id = %id, "Change handler panicked");
        }
    }
}

/// Handle to a pushed subscription.
pub struct SubscriptionHandle {
    lease: Arc<Lease>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop delivery; the listener is released before this returns. Idempotent.
    pub fn unsubscribe(&self) {
        self.task.abort();
        self.lease.release();
    }

    pub fn is_active(&self) -> bool {
        !self.lease.is_released() && !self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Deliver `R` changes to `handler` until unsubscribed.
pub async fn subscribe<R, H>(
    backend: Arc<dyn Backend>,
    mut handler: H,
) -> Result<SubscriptionHandle, SyncError>
where
    R: Record,
    H: ChangeHandler<R>,
{
    let mut subscription = Subscription::<R>::open(backend).await?;
    let lease = subscription.lease.clone();

    let task = tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Delivery::Change(change) => dispatch(&mut handler, change),
                Delivery::Lagged(missed) => handler.on_lagged(missed),
                Delivery::Closed => break,
            }
        }
    });

    Ok(SubscriptionHandle { lease, task })
}
