//! HTTP binding of the hosted service: REST row endpoints and the password auth service.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::{AuthEvent, AuthSession, AuthUser, Backend, ChangeFeed, RealtimeSocket, Select};
use crate::config::Config;
use crate::errors::SyncError;
use crate::models::Table;

/// Header carrying the public API key.
pub const API_KEY_HEADER: &str = "apikey";

/// How long before expiry the access token is renewed.
const REFRESH_LEAD_SECS: i64 = 60;

/// Wait before retrying a refresh that failed for a reason other than a rejected token.
const REFRESH_RETRY: Duration = Duration::from_secs(10);

/// Delay until a token expiring at `expires_at` should be renewed. Short-lived tokens are
/// renewed halfway through their lifetime.
fn refresh_delay(expires_at: i64, now: i64) -> Duration {
    let remaining = expires_at - now;
    let lead = REFRESH_LEAD_SECS.min(remaining / 2);
    Duration::from_secs((remaining - lead).max(0) as u64)
}

/// The pending background refresh. `generation` changes whenever the timer is replaced or
/// cancelled.
#[derive(Default)]
struct RefreshTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

fn lock_timer(timer: &Mutex<RefreshTimer>) -> MutexGuard<'_, RefreshTimer> {
    timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| Utc::now().timestamp() + secs));
        AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AdminUsersResponse {
    users: Vec<AuthUser>,
}

/// Backend client over the service's HTTP API and realtime socket.
///
/// While signed in, the access token is renewed in the background shortly before it expires;
/// each renewal is announced as [`AuthEvent::TokenRefreshed`].
pub struct RestBackend {
    this: Weak<RestBackend>,
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    service_key: Option<String>,
    session: RwLock<Option<AuthSession>>,
    auth_tx: broadcast::Sender<AuthEvent>,
    realtime: RealtimeSocket,
    refresher: Mutex<RefreshTimer>,
}

impl RestBackend {
    pub fn new(config: &Config) -> Result<Arc<Self>, SyncError> {
        let anon_key = config
            .anon_key
            .clone()
            .ok_or_else(|| SyncError::Config("NEWSROOM_ANON_KEY is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let (auth_tx, _) = broadcast::channel(16);

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            http,
            base_url: config.backend_url.clone(),
            anon_key,
            service_key: config.service_key.clone(),
            session: RwLock::new(None),
            auth_tx,
            realtime: RealtimeSocket::new(
                config.realtime_url(),
                config.heartbeat,
                config.realtime_capacity,
            ),
            refresher: Mutex::new(RefreshTimer::default()),
        }))
    }

    fn rest_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    /// Attach the API key and the caller's bearer token (anon key when signed out).
    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone());
        request
            .header(API_KEY_HEADER, &self.anon_key)
            .bearer_auth(bearer)
    }

    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<Value>, SyncError> {
        let response = self.authorized(request).await.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<AuthSession, SyncError> {
        let response = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant_type)])
            .header(API_KEY_HEADER, &self.anon_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::BAD_REQUEST if grant_type == "password" => {
                    SyncError::InvalidCredentials
                }
                StatusCode::BAD_REQUEST => SyncError::Auth(error_text(&body)),
                _ => status_error(status, &body),
            });
        }

        Ok(response.json::<TokenResponse>().await?.into_session())
    }

    /// Install `session` and announce it. A background refresh passes its timer `generation`
    /// and is dropped (returning `false`) if the session changed since the timer was set.
    async fn adopt(
        &self,
        session: AuthSession,
        event: fn(AuthSession) -> AuthEvent,
        generation: Option<u64>,
    ) -> bool {
        let mut current = self.session.write().await;
        if generation.is_some_and(|g| !self.timer_is_current(g)) {
            return false;
        }

        *current = Some(session.clone());
        self.realtime
            .set_access_token(Some(session.access_token.clone()));
        if let Some(expires_at) = session.expires_at {
            self.schedule_refresh(refresh_delay(expires_at, Utc::now().timestamp()));
        }
        let _ = self.auth_tx.send(event(session));
        true
    }

    /// Drop the session and announce it, with the same `generation` check as [`Self::adopt`].
    async fn forget(&self, generation: Option<u64>) {
        let mut current = self.session.write().await;
        if generation.is_some_and(|g| !self.timer_is_current(g)) {
            return;
        }

        self.cancel_refresh();
        *current = None;
        self.realtime.set_access_token(None);
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
    }

    async fn renew(&self, generation: Option<u64>) -> Result<AuthSession, SyncError> {
        let refresh_token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or_else(|| SyncError::Auth("No session to refresh".to_string()))?;

        match self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(session) => {
                if !self
                    .adopt(session.clone(), AuthEvent::TokenRefreshed, generation)
                    .await
                {
                    tracing::debug!("Session changed during refresh, discarding new tokens");
                    return Err(SyncError::Auth("Session ended during refresh".to_string()));
                }
                tracing::debug!(user_id = %session.user.id, "Session refreshed");
                Ok(session)
            }
            Err(err @ SyncError::Auth(_)) => {
                tracing::warn!(error = %err, "Refresh token rejected, signing out");
                self.forget(generation).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Replace the pending background refresh with one that fires after `delay`.
    fn schedule_refresh(&self, delay: Duration) {
        let mut timer = lock_timer(&self.refresher);
        timer.generation += 1;
        if let Some(previous) = timer.task.take() {
            previous.abort();
        }

        let generation = timer.generation;
        let backend = self.this.clone();
        tracing::debug!(delay_secs = delay.as_secs(), "Session refresh scheduled");
        timer.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(backend) = backend.upgrade() else {
                return;
            };
            if !backend.claim_refresh(generation) {
                return;
            }

            match backend.renew(Some(generation)).await {
                Ok(_) => {}
                // the session is gone; nothing left to refresh
                Err(SyncError::Auth(_)) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "Background session refresh failed, retrying");
                    backend.schedule_refresh(REFRESH_RETRY);
                }
            }
        }));
    }

    /// Take the running timer out of its slot so the refresh it performs can schedule the
    /// next one. `false` if the timer was replaced meanwhile.
    fn claim_refresh(&self, generation: u64) -> bool {
        let mut timer = lock_timer(&self.refresher);
        if timer.generation != generation {
            return false;
        }
        timer.task = None;
        true
    }

    fn timer_is_current(&self, generation: u64) -> bool {
        lock_timer(&self.refresher).generation == generation
    }

    fn cancel_refresh(&self) {
        let mut timer = lock_timer(&self.refresher);
        timer.generation += 1;
        if let Some(task) = timer.task.take() {
            task.abort();
        }
    }

    async fn fetch_user(&self, access_token: &str) -> Result<AuthUser, SyncError> {
        let response = self
            .http
            .get(self.auth_url("user"))
            .header(API_KEY_HEADER, &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response.json::<AuthUser>().await?)
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, query: &Select) -> Result<Vec<Value>, SyncError> {
        let mut params: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        for (column, value) in &query.filters {
            params.push((column.clone(), format!("eq.{}", value)));
        }
        if let Some(order) = query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }

        tracing::debug!(table = %query.table, ?params, "select");
        self.send_rows(self.http.get(self.rest_url(query.table)).query(&params))
            .await
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, SyncError> {
        let rows = self
            .send_rows(
                self.http
                    .post(self.rest_url(table))
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::Internal(format!("Insert into {} returned no row", table)))
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, SyncError> {
        let rows = self
            .send_rows(
                self.http
                    .patch(self.rest_url(table))
                    .query(&[("id", format!("eq.{}", id))])
                    .header("Prefer", "return=representation")
                    .json(&patch),
            )
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound(format!("{} row {} not found", table, id)))
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), SyncError> {
        let rows = self
            .send_rows(
                self.http
                    .delete(self.rest_url(table))
                    .query(&[("id", format!("eq.{}", id))])
                    .header("Prefer", "return=representation"),
            )
            .await?;

        if rows.is_empty() {
            return Err(SyncError::NotFound(format!("{} row {} not found", table, id)));
        }
        Ok(())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SyncError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        tracing::info!(user_id = %session.user.id, "Signed in");
        self.adopt(session.clone(), AuthEvent::SignedIn, None).await;
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), SyncError> {
        let token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone());

        let remote = match token {
            Some(token) => {
                let result = self
                    .http
                    .post(self.auth_url("logout"))
                    .header(API_KEY_HEADER, &self.anon_key)
                    .bearer_auth(token)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => Ok(()),
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        Err(status_error(status, &body))
                    }
                    Err(err) => Err(SyncError::from(err)),
                }
            }
            None => Ok(()),
        };

        self.forget(None).await;
        remote
    }

    async fn current_session(&self) -> Option<AuthSession> {
        self.session.read().await.clone()
    }

    async fn restore_session(&self, session: AuthSession) -> Result<AuthSession, SyncError> {
        *self.session.write().await = Some(session.clone());

        if session.is_expired(Utc::now()) {
            tracing::info!(user_id = %session.user.id, "Persisted session expired, refreshing");
            return self.refresh_session().await;
        }

        match self.fetch_user(&session.access_token).await {
            Ok(user) => {
                let session = AuthSession { user, ..session };
                self.adopt(session.clone(), AuthEvent::SignedIn, None).await;
                Ok(session)
            }
            Err(SyncError::Auth(_)) => self.refresh_session().await,
            Err(err) => {
                *self.session.write().await = None;
                Err(err)
            }
        }
    }

    async fn refresh_session(&self) -> Result<AuthSession, SyncError> {
        self.renew(None).await
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn admin_list_users(&self) -> Result<Vec<AuthUser>, SyncError> {
        let service_key = self.service_key.as_ref().ok_or_else(|| {
            SyncError::Permission("Listing users requires NEWSROOM_SERVICE_KEY".to_string())
        })?;

        let response = self
            .http
            .get(self.auth_url("admin/users"))
            .header(API_KEY_HEADER, service_key)
            .bearer_auth(service_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response.json::<AdminUsersResponse>().await?.users)
    }

    async fn subscribe_changes(&self, table: Table) -> Result<ChangeFeed, SyncError> {
        self.realtime.subscribe(table).await
    }

    fn release_changes(&self, table: Table, generation: u64) {
        self.realtime.release(table, generation);
    }
}

impl Drop for RestBackend {
    fn drop(&mut self) {
        self.cancel_refresh();
    }
}

/// Pull a human-readable message out of an error body.
fn error_text(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str))
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Map an unsuccessful HTTP status to the error taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> SyncError {
    let message = error_text(body);
    match status {
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            SyncError::Validation(message)
        }
        StatusCode::UNAUTHORIZED => SyncError::Auth(message),
        StatusCode::FORBIDDEN => SyncError::Permission(message),
        // 406 is what a single-row select answers when nothing matched.
        StatusCode::NOT_FOUND | StatusCode::NOT_ACCEPTABLE => SyncError::NotFound(message),
        _ => SyncError::Transport(format!("{}: {}", status, message)),
    }
}
