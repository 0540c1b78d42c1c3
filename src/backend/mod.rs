//! Hosted service contract.
//!
//! Row storage, authentication and change delivery all live in the hosted service. This module
//! defines what the board consumes from it ([`Backend`]) and binds that contract over HTTP and
//! the service's realtime websocket ([`RestBackend`]).

mod rest;
mod socket;

pub use rest::*;
pub use socket::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::SyncError;
use crate::models::{SortKey, Table};

/// Row query: equality filters plus an optional ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: Table,
    pub filters: Vec<(String, String)>,
    pub order: Option<SortKey>,
}

impl Select {
    pub fn all(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, key: SortKey) -> Self {
        self.order = Some(key);
        self
    }
}

/// An identity known to the auth service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Value,
}

/// Tokens for an authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl AuthSession {
    /// Treat tokens within a minute of expiry as already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at <= now.timestamp() + 60)
            .unwrap_or(false)
    }
}

/// Session changes announced by the auth client.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    TokenRefreshed(AuthSession),
    SignedOut,
}

/// Kind of row change in the change stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One undecoded change-stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub table: Table,
    pub kind: ChangeKind,
    /// Row after the change (insert/update)
    pub new: Option<Value>,
    /// Row before the change; for deletes at least the primary key
    pub old: Option<Value>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// One listener on a table's change stream.
#[derive(Debug)]
pub struct ChangeFeed {
    pub receiver: broadcast::Receiver<RawChange>,
    /// Channel the listener was counted on. A channel rebuilt after the stream ended gets a new
    /// generation, so releases from listeners of the old one are ignored.
    pub generation: u64,
}

/// What the board consumes from the hosted service.
///
/// Row operations are scoped server-side to the authenticated identity; nothing here enforces
/// authorization.
#[async_trait]
pub trait Backend: Send + Sync {
    // ==================== ROW STORE ====================

    async fn select(&self, query: &Select) -> Result<Vec<Value>, SyncError>;

    /// Insert and return the stored row.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, SyncError>;

    /// Update by id and return the stored row; `NotFound` if no row matched.
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, SyncError>;

    /// Delete by id; `NotFound` if no row matched.
    async fn delete(&self, table: Table, id: &str) -> Result<(), SyncError>;

    // ==================== AUTH ====================

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError>;

    /// Revoke the session remotely. Local tokens are dropped even when this fails.
    async fn sign_out(&self) -> Result<(), SyncError>;

    async fn current_session(&self) -> Option<AuthSession>;

    /// Adopt a persisted session, refreshing it if needed.
    async fn restore_session(&self, session: AuthSession) -> Result<AuthSession, SyncError>;

    async fn refresh_session(&self) -> Result<AuthSession, SyncError>;

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;

    /// Privileged listing of every identity.
    async fn admin_list_users(&self) -> Result<Vec<AuthUser>, SyncError>;

    // ==================== CHANGE STREAM ====================

    /// Start (or join) delivery of changes to `table`.
    async fn subscribe_changes(&self, table: Table) -> Result<ChangeFeed, SyncError>;

    /// Drop one listener on `table`'s channel `generation`; delivery stops once none are left.
    /// Releases for a generation that is no longer current do nothing.
    fn release_changes(&self, table: Table, generation: u64);
}
