//! In-memory stand-in for the hosted service, used by the test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::backend::{
    AuthEvent, AuthSession, AuthUser, Backend, ChangeFeed, ChangeKind, RawChange, Select,
};
use crate::errors::SyncError;
use crate::models::{Role, Table, UserProfile};

/// Backend call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Select,
    Insert,
    Update,
    Delete,
    SignOut,
}

struct Account {
    email: String,
    password: String,
    user: AuthUser,
}

struct Listeners {
    sender: broadcast::Sender<RawChange>,
    count: usize,
    generation: u64,
}

pub struct MemoryBackend {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    accounts: Mutex<Vec<Account>>,
    session: Mutex<Option<AuthSession>>,
    auth_tx: broadcast::Sender<AuthEvent>,
    listeners: Mutex<HashMap<Table, Listeners>>,
    failures: Mutex<VecDeque<(Op, SyncError)>>,
    hold: AtomicBool,
    held: Mutex<Vec<RawChange>>,
    selects: Mutex<HashMap<Table, usize>>,
    clock: Mutex<DateTime<Utc>>,
    select_delay: Mutex<Option<Duration>>,
    generations: AtomicU64,
    capacity: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (auth_tx, _) = broadcast::channel(16);
        Self {
            tables: Mutex::new(HashMap::new()),
            accounts: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            auth_tx,
            listeners: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            hold: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            selects: Mutex::new(HashMap::new()),
            clock: Mutex::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()),
            select_delay: Mutex::new(None),
            generations: AtomicU64::new(0),
            capacity,
        }
    }

    /// Register an account and its profile row.
    pub fn seed_account(&self, name: &str, email: &str, password: &str, role: Role) -> String {
        let id = format!("user-{}", email.split('@').next().unwrap());
        self.accounts.lock().unwrap().push(Account {
            email: email.to_string(),
            password: password.to_string(),
            user: AuthUser {
                id: id.clone(),
                email: Some(email.to_string()),
                created_at: Some(self.tick()),
                last_sign_in_at: None,
                user_metadata: Value::Null,
            },
        });
        let profile = UserProfile {
            id: id.clone(),
            email: email.to_string(),
            full_name: name.to_string(),
            role,
            sports_section: None,
            knowledge_section: None,
            password_code: String::new(),
            created_at: None,
            updated_at: None,
        };
        self.seed_row(Table::Profiles, serde_json::to_value(profile).unwrap());
        id
    }

    /// Register an identity with no profile row.
    pub fn seed_bare_account(&self, email: &str, password: &str) -> String {
        let id = format!("user-{}", email.split('@').next().unwrap());
        self.accounts.lock().unwrap().push(Account {
            email: email.to_string(),
            password: password.to_string(),
            user: AuthUser {
                id: id.clone(),
                email: Some(email.to_string()),
                created_at: None,
                last_sign_in_at: None,
                user_metadata: Value::Null,
            },
        });
        id
    }

    pub fn seed_row(&self, table: Table, row: Value) {
        self.tables.lock().unwrap().entry(table).or_default().push(row);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_next(&self, op: Op, err: SyncError) {
        self.failures.lock().unwrap().push_back((op, err));
    }

    /// Queue change notifications instead of delivering them.
    pub fn hold_notifications(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Deliver every queued notification, in order.
    pub fn flush_notifications(&self) {
        let held: Vec<RawChange> = self.held.lock().unwrap().drain(..).collect();
        for change in held {
            self.deliver(change);
        }
    }

    /// Simulate a change made by another client.
    pub fn publish(&self, change: RawChange) {
        self.deliver(change);
    }

    /// End the change stream for `table`, as a dropped socket would.
    pub fn close_changes(&self, table: Table) {
        self.listeners.lock().unwrap().remove(&table);
    }

    pub fn listener_count(&self, table: Table) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(&table)
            .map(|l| l.count)
            .unwrap_or(0)
    }

    pub fn select_count(&self, table: Table) -> usize {
        self.selects
            .lock()
            .unwrap()
            .get(&table)
            .copied()
            .unwrap_or(0)
    }

    /// Delay every select, to widen race windows.
    pub fn set_select_delay(&self, delay: Option<Duration>) {
        *self.select_delay.lock().unwrap() = delay;
    }

    /// Next timestamp; advances one second per call.
    pub fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap();
        *clock += chrono::Duration::seconds(1);
        *clock
    }

    fn take_failure(&self, op: Op) -> Result<(), SyncError> {
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures.iter().position(|(o, _)| *o == op) {
            let (_, err) = failures.remove(pos).unwrap();
            return Err(err);
        }
        Ok(())
    }

    fn emit(&self, table: Table, kind: ChangeKind, new: Option<Value>, old: Option<Value>) {
        let change = RawChange {
            table,
            kind,
            new,
            old,
            commit_timestamp: Some(self.tick()),
        };
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(change);
        } else {
            self.deliver(change);
        }
    }

    fn deliver(&self, change: RawChange) {
        if let Some(listeners) = self.listeners.lock().unwrap().get(&change.table) {
            let _ = listeners.sender.send(change);
        }
    }

    fn require_session(&self) -> Result<AuthSession, SyncError> {
        self.session
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SyncError::Auth("not signed in".to_string()))
    }

    fn issue_session(&self, user: AuthUser) -> AuthSession {
        let stamp = self.tick().timestamp();
        AuthSession {
            access_token: format!("access-{}-{}", user.id, stamp),
            refresh_token: format!("refresh-{}-{}", user.id, stamp),
            expires_at: Some(stamp + 3600),
            user,
        }
    }
}

fn matches_filters(row: &Value, filters: &[(String, String)]) -> bool {
    filters.iter().all(|(column, expected)| match &row[column.as_str()] {
        Value::String(s) => s == expected,
        Value::Null => false,
        other => other.to_string() == *expected,
    })
}

fn sort_value(row: &Value, column: &str) -> String {
    match &row[column] {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc).to_rfc3339())
            .unwrap_or_else(|_| s.clone()),
        other => other.to_string(),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: &Select) -> Result<Vec<Value>, SyncError> {
        let delay = *self.select_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.selects.lock().unwrap().entry(query.table).or_default() += 1;
        self.take_failure(Op::Select)?;

        let mut rows: Vec<Value> = self
            .rows(query.table)
            .into_iter()
            .filter(|row| matches_filters(row, &query.filters))
            .collect();

        if let Some(order) = query.order {
            rows.sort_by(|a, b| {
                let ordering = sort_value(a, order.column).cmp(&sort_value(b, order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, mut row: Value) -> Result<Value, SyncError> {
        self.take_failure(Op::Insert)?;
        self.require_session()?;

        let now = self.tick().to_rfc3339();
        row["id"] = json!(uuid::Uuid::new_v4().to_string());
        row["created_at"] = json!(now);
        row["updated_at"] = json!(now);

        self.tables
            .lock()
            .unwrap()
            .entry(table)
            .or_default()
            .push(row.clone());
        self.emit(table, ChangeKind::Insert, Some(row.clone()), None);
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, SyncError> {
        self.take_failure(Op::Update)?;
        self.require_session()?;

        let updated = {
            let mut tables = self.tables.lock().unwrap();
            let row = tables
                .get_mut(&table)
                .and_then(|rows| rows.iter_mut().find(|r| r["id"] == id))
                .ok_or_else(|| SyncError::NotFound(format!("{} row {} not found", table, id)))?;

            if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            row["updated_at"] = json!(self.tick().to_rfc3339());
            row.clone()
        };

        self.emit(
            table,
            ChangeKind::Update,
            Some(updated.clone()),
            Some(json!({ "id": id })),
        );
        Ok(updated)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), SyncError> {
        self.take_failure(Op::Delete)?;
        self.require_session()?;

        let removed = {
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table).or_default();
            let before = rows.len();
            rows.retain(|r| r["id"] != id);
            before != rows.len()
        };
        if !removed {
            return Err(SyncError::NotFound(format!("{} row {} not found", table, id)));
        }

        self.emit(table, ChangeKind::Delete, None, Some(json!({ "id": id })));
        Ok(())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError> {
        let user = {
            let accounts = self.accounts.lock().unwrap();
            let account = accounts
                .iter()
                .find(|a| a.email == email && a.password == password)
                .ok_or(SyncError::InvalidCredentials)?;
            account.user.clone()
        };

        let session = self.issue_session(user);
        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), SyncError> {
        let remote = self.take_failure(Op::SignOut);
        *self.session.lock().unwrap() = None;
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
        remote
    }

    async fn current_session(&self) -> Option<AuthSession> {
        self.session.lock().unwrap().clone()
    }

    async fn restore_session(&self, session: AuthSession) -> Result<AuthSession, SyncError> {
        let known = self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.user.id == session.user.id);
        if !known {
            return Err(SyncError::Auth("unknown session".to_string()));
        }

        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn refresh_session(&self) -> Result<AuthSession, SyncError> {
        let current = self.require_session()?;
        let session = self.issue_session(current.user);
        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn admin_list_users(&self) -> Result<Vec<AuthUser>, SyncError> {
        self.require_session()?;
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.user.clone())
            .collect())
    }

    async fn subscribe_changes(&self, table: Table) -> Result<ChangeFeed, SyncError> {
        let mut listeners = self.listeners.lock().unwrap();
        let entry = listeners.entry(table).or_insert_with(|| Listeners {
            sender: broadcast::channel(self.capacity).0,
            count: 0,
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
        });
        entry.count += 1;
        Ok(ChangeFeed {
            receiver: entry.sender.subscribe(),
            generation: entry.generation,
        })
    }

    fn release_changes(&self, table: Table, generation: u64) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(entry) = listeners.get_mut(&table) {
            if entry.generation != generation {
                return;
            }
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                listeners.remove(&table);
            }
        }
    }
}
