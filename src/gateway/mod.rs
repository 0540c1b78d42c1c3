//! Remote data gateway for leads and events.
//!
//! Stateless request/response operations over the hosted row store. Results may race with
//! change notifications for the same row; reconciling the two is the caller's job.

use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::backend::{Backend, Select};
use crate::errors::SyncError;
use crate::models::{Event, Lead, Record};

/// Gateway for one record kind.
pub struct Gateway<R: Record> {
    backend: Arc<dyn Backend>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for Gateway<R> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            _record: PhantomData,
        }
    }
}

pub type LeadGateway = Gateway<Lead>;
pub type EventGateway = Gateway<Event>;

impl<R: Record> Gateway<R> {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            _record: PhantomData,
        }
    }

    /// Every row, in the kind's sort order.
    pub async fn list(&self) -> Result<Vec<R>, SyncError> {
        let query = Select::all(R::TABLE).order_by(R::SORT);
        let rows = self.backend.select(&query).await.map_err(|e| {
            tracing::error!(table = %R::TABLE, error = %e, "List failed");
            e
        })?;

        let mut records = rows
            .into_iter()
            .map(decode::<R>)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(R::sort_cmp);

        tracing::debug!(table = %R::TABLE, count = records.len(), "Listed rows");
        Ok(records)
    }

    /// Create a row; the service assigns id and timestamps, the creator is the signed-in identity.
    pub async fn create(&self, draft: &R::Draft) -> Result<R, SyncError> {
        R::preview(draft).validate()?;

        let session = self
            .backend
            .current_session()
            .await
            .ok_or_else(|| SyncError::Auth("User not authenticated".to_string()))?;

        let mut row = serde_json::to_value(draft)?;
        row["created_by"] = json!(session.user.id);

        let stored = self.backend.insert(R::TABLE, row).await.map_err(|e| {
            tracing::error!(table = %R::TABLE, op = "create", error = %e, "Gateway call failed");
            e
        })?;
        let record = decode::<R>(stored)?;

        tracing::info!(table = %R::TABLE, id = %record.id(), "Created row");
        Ok(record)
    }

    /// Apply a partial update and return the stored row.
    pub async fn update(&self, id: &str, patch: &R::Patch) -> Result<R, SyncError> {
        let body = serde_json::to_value(patch)?;
        let stored = self
            .backend
            .update(R::TABLE, id, body)
            .await
            .map_err(|e| {
                tracing::error!(table = %R::TABLE, id = %id, op = "update", error = %e, "Gateway call failed");
                e
            })?;
        let record = decode::<R>(stored)?;

        tracing::info!(table = %R::TABLE, id = %id, "Updated row");
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.backend.delete(R::TABLE, id).await.map_err(|e| {
            tracing::error!(table = %R::TABLE, id = %id, op = "delete", error = %e, "Gateway call failed");
            e
        })?;

        tracing::info!(table = %R::TABLE, id = %id, "Deleted row");
        Ok(())
    }
}

fn decode<R: Record>(row: Value) -> Result<R, SyncError> {
    serde_json::from_value(row).map_err(|e| {
        SyncError::Internal(format!("Undecodable {} row: {}", R::TABLE, e))
    })
}
