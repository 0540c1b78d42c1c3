//! Process-wide session context.
//!
//! Holds the signed-in user and is the only writer of that state: `login`, `logout`,
//! `restore` and `refresh` run one at a time, and the auth-event listener reacts to
//! refreshes and sign-outs reported by the backend. Profile fetches for the same identity
//! share a single request; a new sign-in or a token refresh starts a new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast::error::RecvError, watch, OnceCell};
use tokio::task::JoinHandle;

use crate::backend::{AuthEvent, AuthSession, Backend, Select};
use crate::errors::SyncError;
use crate::models::{CurrentUser, Role, Table, UserProfile};

type ProfileFetch = Arc<OnceCell<Option<UserProfile>>>;

/// An authenticated identity. `user` is `None` when its profile could not be loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
    pub user: Option<CurrentUser>,
}

impl Identity {
    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role)
    }
}

pub struct SessionContext {
    backend: Arc<dyn Backend>,
    session_path: Option<PathBuf>,
    current: watch::Sender<Option<CurrentUser>>,
    writer: tokio::sync::Mutex<()>,
    profile_fetches: Mutex<HashMap<String, ProfileFetch>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    /// `session_path` is where the session token is persisted; `None` keeps it in memory only.
    pub fn new(backend: Arc<dyn Backend>, session_path: Option<PathBuf>) -> Arc<Self> {
        let (current, _) = watch::channel(None);
        Arc::new(Self {
            backend,
            session_path,
            current,
            writer: tokio::sync::Mutex::new(()),
            profile_fetches: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        })
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.current.borrow().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Observe sign-in state changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<CurrentUser>> {
        self.current.subscribe()
    }

    // ==================== WRITERS ====================

    /// Sign in by display name.
    ///
    /// The name is resolved to the account e-mail through the `profiles` table first.
    pub async fn login(&self, display_name: &str, password: &str) -> Result<Identity, SyncError> {
        let _writer = self.writer.lock().await;
        tracing::info!(display_name = %display_name, "Login attempt");

        let email = self.resolve_email(display_name).await?;
        // a new sign-in is a new session; its profile is fetched again
        self.forget_profiles();
        let session = self
            .backend
            .sign_in_with_password(&email, password)
            .await
            .map_err(|e| {
                tracing::info!(display_name = %display_name, error = %e, "Sign-in rejected");
                e
            })?;

        self.persist(&session).await;
        let identity = self.load_identity(&session, false).await;
        tracing::info!(user_id = %identity.id, role = ?identity.role(), "Login succeeded");
        Ok(identity)
    }

    /// Sign out. Local state is cleared even if the backend call fails.
    pub async fn logout(&self) {
        let _writer = self.writer.lock().await;

        if let Err(e) = self.backend.sign_out().await {
            tracing::warn!(error = %e, "Remote sign-out failed; clearing local session anyway");
        }
        self.clear_local().await;
        tracing::info!("Logged out");
    }

    /// Resume the persisted session, if there is a usable one.
    pub async fn restore(&self) -> Result<Option<Identity>, SyncError> {
        let _writer = self.writer.lock().await;

        let Some(saved) = self.read_persisted().await? else {
            return Ok(None);
        };

        match self.backend.restore_session(saved).await {
            Ok(session) => {
                self.persist(&session).await;
                let identity = self.load_identity(&session, false).await;
                tracing::info!(user_id = %identity.id, "Session restored");
                Ok(Some(identity))
            }
            Err(SyncError::Auth(reason)) => {
                tracing::info!(reason = %reason, "Persisted session is no longer valid");
                self.clear_local().await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Renew the access token and reload the profile.
    pub async fn refresh(&self) -> Result<Identity, SyncError> {
        let _writer = self.writer.lock().await;

        let session = match self.backend.refresh_session().await {
            Ok(session) => session,
            Err(e @ SyncError::Auth(_)) => {
                self.clear_local().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.persist(&session).await;
        Ok(self.load_identity(&session, true).await)
    }

    // ==================== AUTH EVENTS ====================

    /// Start reacting to auth events from the backend. Calling it again is a no-op.
    pub fn watch(self: &Arc<Self>) {
        let Ok(mut listener) = self.listener.lock() else {
            return;
        };
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut events = self.backend.auth_events();
        let context: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Auth events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(context) = context.upgrade() else {
                    break;
                };
                context.on_auth_event(event).await;
            }
        }));
    }

    /// Stop the auth-event listener.
    pub fn shutdown(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
    }

    async fn on_auth_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) => {
                let already_loaded = self
                    .current
                    .borrow()
                    .as_ref()
                    .is_some_and(|user| user.id == session.user.id);
                if !already_loaded {
                    self.load_identity(&session, false).await;
                }
            }
            AuthEvent::TokenRefreshed(session) => {
                // a later refresh or a sign-out already replaced these tokens
                let current = self.backend.current_session().await;
                if current.map(|c| c.access_token) != Some(session.access_token.clone()) {
                    return;
                }
                self.persist(&session).await;
                self.load_identity(&session, true).await;
            }
            AuthEvent::SignedOut => {
                // a later sign-in may already have replaced the session
                if self.backend.current_session().await.is_some() {
                    return;
                }
                if self.current.borrow().is_some() {
                    tracing::info!("Signed out by the backend");
                }
                self.clear_local().await;
            }
        }
    }

    // ==================== PROFILE ====================

    async fn resolve_email(&self, display_name: &str) -> Result<String, SyncError> {
        let query = Select::all(Table::Profiles).eq("full_name", display_name);
        let rows = self.backend.select(&query).await?;

        let [row] = rows.as_slice() else {
            tracing::info!(display_name = %display_name, matches = rows.len(), "No unique profile for display name");
            return Err(SyncError::UnknownUser(display_name.to_string()));
        };
        row.get("email")
            .and_then(|email| email.as_str())
            .map(str::to_string)
            .ok_or_else(|| SyncError::UnknownUser(display_name.to_string()))
    }

    /// Fetch the profile for `session` and publish it, unless the session ended meanwhile.
    async fn load_identity(&self, session: &AuthSession, fresh: bool) -> Identity {
        let user_id = session.user.id.clone();
        let profile = self.fetch_profile(&user_id, fresh).await;

        let user = profile.map(|mut profile| {
            if let Some(email) = &session.user.email {
                profile.email = email.clone();
            }
            CurrentUser::from_profile(profile)
        });

        let still_current = self
            .backend
            .current_session()
            .await
            .is_some_and(|current| current.user.id == user_id);
        if still_current {
            self.current.send_replace(user.clone());
        } else {
            tracing::debug!(user_id = %user_id, "Session ended before the profile arrived");
        }

        Identity {
            id: user_id,
            email: session.user.email.clone(),
            user,
        }
    }

    /// Profile row for `user_id`. A failed fetch counts as no profile.
    ///
    /// Callers share the fetch already made (or in flight) for the identity; `fresh` replaces
    /// a completed one.
    async fn fetch_profile(&self, user_id: &str, fresh: bool) -> Option<UserProfile> {
        let cell = {
            let Ok(mut fetches) = self.profile_fetches.lock() else {
                return None;
            };
            let cell = fetches.entry(user_id.to_string()).or_default();
            if fresh && cell.initialized() {
                *cell = ProfileFetch::default();
            }
            cell.clone()
        };

        cell.get_or_init(|| async {
            let query = Select::all(Table::Profiles).eq("id", user_id);
            match self.backend.select(&query).await {
                Ok(rows) => match rows.into_iter().next().map(serde_json::from_value::<UserProfile>) {
                    Some(Ok(profile)) => Some(profile),
                    Some(Err(e)) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Undecodable profile");
                        None
                    }
                    None => {
                        tracing::warn!(user_id = %user_id, "No profile for identity");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Profile fetch failed");
                    None
                }
            }
        })
        .await
        .clone()
    }

    /// Drop every cached profile fetch. Fetches still in flight finish for their callers.
    fn forget_profiles(&self) {
        if let Ok(mut fetches) = self.profile_fetches.lock() {
            fetches.clear();
        }
    }

    // ==================== PERSISTENCE ====================

    async fn clear_local(&self) {
        self.current.send_replace(None);
        self.forget_profiles();
        if let Some(path) = &self.session_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = ?path, error = %e, "Could not remove session file"),
            }
        }
    }

    async fn persist(&self, session: &AuthSession) {
        let Some(path) = &self.session_path else {
            return;
        };
        if let Err(e) = write_session(path, session).await {
            tracing::warn!(path = ?path, error = %e, "Could not persist session");
        }
    }

    async fn read_persisted(&self) -> Result<Option<AuthSession>, SyncError> {
        let Some(path) = &self.session_path else {
            return Ok(None);
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&text) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Ignoring unreadable session file");
                Ok(None)
            }
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn write_session(path: &Path, session: &AuthSession) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_vec_pretty(session)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
