//! Integration tests against a stub of the hosted service.
//!
//! The stub speaks the row, auth and realtime endpoints the board uses, so these tests drive
//! the real HTTP and websocket client end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::auth::{SessionContext, UserDirectory};
use crate::backend::{AuthEvent, Backend, RestBackend};
use crate::config::Config;
use crate::errors::{messages, ErrorSurface, SyncError, UserAction};
use crate::gateway::LeadGateway;
use crate::models::{LeadPatch, LeadStatus, NewLead, Reporter, Role};
use crate::pages::{LeadBoard, PageEvent};

const ANON_KEY: &str = "test-anon-key";
const SERVICE_KEY: &str = "test-service-key";

// ==================== STUB SERVICE ====================

struct Account {
    id: String,
    email: String,
    password: String,
    full_name: String,
    created_at: String,
    last_sign_in_at: Option<String>,
}

impl Account {
    fn to_user(&self) -> Value {
        json!({
            "id": self.id,
            "email": self.email,
            "created_at": self.created_at,
            "last_sign_in_at": self.last_sign_in_at,
            "user_metadata": { "full_name": self.full_name }
        })
    }
}

#[derive(Default)]
struct Stub {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    accounts: Mutex<Vec<Account>>,
    /// access token -> user id
    tokens: Mutex<HashMap<String, String>>,
    /// refresh token -> user id
    refresh_tokens: Mutex<HashMap<String, String>>,
    issued: AtomicU64,
    /// `expires_in` of issued tokens, seconds
    token_lifetime: AtomicU64,
    changes: Option<broadcast::Sender<String>>,
}

impl Stub {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            changes: Some(changes),
            token_lifetime: AtomicU64::new(3600),
            ..Self::default()
        }
    }

    /// Account plus its profile row.
    fn seed_account(&self, full_name: &str, email: &str, password: &str, role: Role) -> String {
        let id = self.seed_bare_account(full_name, email, password);
        self.tables
            .lock()
            .unwrap()
            .entry("profiles".to_string())
            .or_default()
            .push(json!({
                "id": id,
                "email": email,
                "full_name": full_name,
                "role": role.as_str(),
                "sports_section": null,
                "knowledge_section": "醫藥",
                "password_code": password,
            }));
        id
    }

    /// Account with no profile row; `full_name` only lands in the auth metadata.
    fn seed_bare_account(&self, full_name: &str, email: &str, password: &str) -> String {
        let id = format!("user-{}", email.split('@').next().unwrap_or(email));
        self.accounts.lock().unwrap().push(Account {
            id: id.clone(),
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
            created_at: now(),
            last_sign_in_at: None,
        });
        id
    }

    fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn issue_tokens(&self, user_id: &str) -> (String, String) {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let access = format!("access-{}-{}", user_id, n);
        let refresh = format!("refresh-{}-{}", user_id, n);
        self.tokens
            .lock()
            .unwrap()
            .insert(access.clone(), user_id.to_string());
        self.refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh.clone(), user_id.to_string());
        (access, refresh)
    }

    fn user_for(&self, headers: &HeaderMap) -> Option<String> {
        let token = bearer(headers)?;
        self.tokens.lock().unwrap().get(&token).cloned()
    }

    fn announce(&self, table: &str, kind: &str, record: Value, old: Value) {
        let frame = json!({
            "topic": format!("realtime:{}_changes", table),
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": table,
                    "type": kind,
                    "commit_timestamp": now(),
                    "record": record,
                    "old_record": old,
                    "errors": null
                }
            },
            "ref": null
        });
        if let Some(changes) = &self.changes {
            let _ = changes.send(frame.to_string());
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn check_key(headers: &HeaderMap) -> Result<(), Response> {
    match headers.get("apikey").and_then(|v| v.to_str().ok()) {
        Some(ANON_KEY) | Some(SERVICE_KEY) => Ok(()),
        _ => Err(reject(StatusCode::UNAUTHORIZED, "No API key found in request")),
    }
}

fn column_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn row_id(params: &HashMap<String, String>) -> Option<String> {
    params
        .get("id")
        .and_then(|v| v.strip_prefix("eq."))
        .map(str::to_string)
}

async fn select_rows(
    State(stub): State<Arc<Stub>>,
    Path(table): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejected) = check_key(&headers) {
        return rejected;
    }

    let mut rows: Vec<Value> = stub
        .rows(&table)
        .into_iter()
        .filter(|row| {
            params
                .iter()
                .filter(|(column, _)| column.as_str() != "select" && column.as_str() != "order")
                .all(|(column, filter)| match filter.strip_prefix("eq.") {
                    Some(expected) => row.get(column).map(column_text).as_deref() == Some(expected),
                    None => true,
                })
        })
        .collect();

    if let Some((column, direction)) = params.get("order").and_then(|o| o.rsplit_once('.')) {
        rows.sort_by_key(|row| row.get(column).map(column_text).unwrap_or_default());
        if direction == "desc" {
            rows.reverse();
        }
    }

    Json(rows).into_response()
}

async fn insert_row(
    State(stub): State<Arc<Stub>>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(mut row): Json<Value>,
) -> Response {
    if let Err(rejected) = check_key(&headers) {
        return rejected;
    }
    if stub.user_for(&headers).is_none() {
        return reject(
            StatusCode::FORBIDDEN,
            &format!("new row violates row-level security policy for table \"{}\"", table),
        );
    }

    let stamp = now();
    row["id"] = json!(uuid::Uuid::new_v4().to_string());
    row["created_at"] = json!(stamp);
    row["updated_at"] = json!(stamp);
    stub.tables
        .lock()
        .unwrap()
        .entry(table.clone())
        .or_default()
        .push(row.clone());
    stub.announce(&table, "INSERT", row.clone(), json!({}));

    (StatusCode::CREATED, Json(vec![row])).into_response()
}

async fn update_row(
    State(stub): State<Arc<Stub>>,
    Path(table): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(patch): Json<Value>,
) -> Response {
    if let Err(rejected) = check_key(&headers) {
        return rejected;
    }
    if stub.user_for(&headers).is_none() {
        return reject(StatusCode::FORBIDDEN, "permission denied");
    }
    let Some(id) = row_id(&params) else {
        return reject(StatusCode::BAD_REQUEST, "missing id filter");
    };

    let updated = {
        let mut tables = stub.tables.lock().unwrap();
        let rows = tables.entry(table.clone()).or_default();
        rows.iter_mut()
            .find(|row| row["id"] == json!(id))
            .map(|row| {
                if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
                row["updated_at"] = json!(now());
                row.clone()
            })
    };

    match updated {
        Some(row) => {
            stub.announce(&table, "UPDATE", row.clone(), json!({ "id": id }));
            Json(vec![row]).into_response()
        }
        None => Json(Vec::<Value>::new()).into_response(),
    }
}

async fn delete_row(
    State(stub): State<Arc<Stub>>,
    Path(table): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejected) = check_key(&headers) {
        return rejected;
    }
    if stub.user_for(&headers).is_none() {
        return reject(StatusCode::FORBIDDEN, "permission denied");
    }
    let Some(id) = row_id(&params) else {
        return reject(StatusCode::BAD_REQUEST, "missing id filter");
    };

    let removed = {
        let mut tables = stub.tables.lock().unwrap();
        let rows = tables.entry(table.clone()).or_default();
        let position = rows.iter().position(|row| row["id"] == json!(id));
        position.map(|index| rows.remove(index))
    };

    match removed {
        Some(row) => {
            stub.announce(&table, "DELETE", json!({}), json!({ "id": id }));
            Json(vec![row]).into_response()
        }
        None => Json(Vec::<Value>::new()).into_response(),
    }
}

async fn token(
    State(stub): State<Arc<Stub>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(rejected) = check_key(&headers) {
        return rejected;
    }

    let user_id = match params.get("grant_type").map(String::as_str) {
        Some("password") => {
            let mut accounts = stub.accounts.lock().unwrap();
            let account = accounts
                .iter_mut()
                .find(|a| Some(a.email.as_str()) == body["email"].as_str())
                .filter(|a| Some(a.password.as_str()) == body["password"].as_str());
            match account {
                Some(account) => {
                    account.last_sign_in_at = Some(now());
                    account.id.clone()
                }
                None => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "error": "invalid_grant",
                            "error_description": "Invalid login credentials"
                        })),
                    )
                        .into_response()
                }
            }
        }
        Some("refresh_token") => {
            let refresh = body["refresh_token"].as_str().unwrap_or_default();
            match stub.refresh_tokens.lock().unwrap().remove(refresh) {
                Some(user_id) => user_id,
                None => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "error": "invalid_grant",
                            "error_description": "Invalid Refresh Token: Refresh Token Not Found"
                        })),
                    )
                        .into_response()
                }
            }
        }
        _ => return reject(StatusCode::BAD_REQUEST, "unsupported grant_type"),
    };

    let (access, refresh) = stub.issue_tokens(&user_id);
    let user = stub
        .accounts
        .lock()
        .unwrap()
        .iter()
        .find(|a| a.id == user_id)
        .map(Account::to_user)
        .unwrap_or_else(|| json!({ "id": user_id }));

    Json(json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": stub.token_lifetime.load(Ordering::SeqCst),
        "refresh_token": refresh,
        "user": user
    }))
    .into_response()
}

async fn auth_user(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> Response {
    if let Err(rejected) = check_key(&headers) {
        return rejected;
    }
    let Some(user_id) = stub.user_for(&headers) else {
        return reject(StatusCode::UNAUTHORIZED, "invalid JWT");
    };
    let accounts = stub.accounts.lock().unwrap();
    match accounts.iter().find(|a| a.id == user_id) {
        Some(account) => Json(account.to_user()).into_response(),
        None => reject(StatusCode::NOT_FOUND, "User not found"),
    }
}

async fn logout(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> Response {
    if let Some(token) = bearer(&headers) {
        stub.tokens.lock().unwrap().remove(&token);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn admin_users(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> Response {
    if bearer(&headers).as_deref() != Some(SERVICE_KEY) {
        return reject(StatusCode::FORBIDDEN, "User not allowed");
    }
    let users: Vec<Value> = stub.accounts.lock().unwrap().iter().map(Account::to_user).collect();
    Json(json!({ "users": users, "aud": "authenticated" })).into_response()
}

async fn realtime(ws: WebSocketUpgrade, State(stub): State<Arc<Stub>>) -> Response {
    // subscribe before the handshake completes so no change is missed
    let changes = match &stub.changes {
        Some(changes) => changes.subscribe(),
        None => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    };
    ws.on_upgrade(move |socket| relay_changes(socket, changes))
}

async fn relay_changes(mut socket: WebSocket, mut changes: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => continue,
                _ => break,
            },
            change = changes.recv() => match change {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn create_stub_router(stub: Arc<Stub>) -> Router {
    Router::new()
        .route(
            "/rest/v1/{table}",
            get(select_rows)
                .post(insert_row)
                .patch(update_row)
                .delete(delete_row),
        )
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/user", get(auth_user))
        .route("/auth/v1/logout", post(logout))
        .route("/auth/v1/admin/users", get(admin_users))
        .route("/realtime/v1/websocket", get(realtime))
        .with_state(stub)
}

// ==================== FIXTURE ====================

/// Test fixture for integration tests.
struct TestFixture {
    stub: Arc<Stub>,
    config: Config,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let stub = Arc::new(Stub::new());
        stub.seed_account("方凱琪", "fangkaiqi@news.com", "A甲", Role::Admin);
        stub.seed_account("江虹", "jianghong@news.com", "B乙", Role::Reporter);
        stub.seed_bare_account("新同事", "newbie@news.com", "Z");

        let app = create_stub_router(stub.clone());

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let config = Config {
            backend_url: format!("http://{}", addr),
            anon_key: Some(ANON_KEY.to_string()),
            service_key: Some(SERVICE_KEY.to_string()),
            session_path: temp_dir.path().join("state").join("session.json"),
            realtime_capacity: 64,
            heartbeat: Duration::from_secs(30),
            log_level: "warn".to_string(),
            log_json: false,
            login_name: None,
            login_password: None,
        };

        TestFixture {
            stub,
            config,
            _temp_dir: temp_dir,
        }
    }

    fn backend(&self) -> Arc<dyn Backend> {
        RestBackend::new(&self.config).expect("Failed to build backend")
    }

    /// A fresh client signed in as `name`, without session persistence.
    async fn login(&self, name: &str, password: &str) -> Arc<SessionContext> {
        let session = SessionContext::new(self.backend(), None);
        session.login(name, password).await.expect("Login failed");
        session
    }
}

/// Wait for the board to report a change to `id`.
async fn wait_for_change(board: &mut LeadBoard, id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match board.next_event().await {
                PageEvent::Changed { id: changed } if changed == id => return,
                PageEvent::Closed | PageEvent::Disconnected => panic!("change stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("No change notification arrived");
}

// ==================== AUTH TESTS ====================

#[tokio::test]
async fn test_login_by_display_name() {
    let fixture = TestFixture::new().await;
    let session = SessionContext::new(fixture.backend(), None);

    let identity = session.login("方凱琪", "A甲").await.unwrap();

    assert_eq!(identity.id, "user-fangkaiqi");
    assert_eq!(identity.role(), Some(Role::Admin));
    let user = session.current_user().unwrap();
    assert_eq!(user.name, "方凱琪");
    assert_eq!(user.email, "fangkaiqi@news.com");
    assert_eq!(user.profile.knowledge_section.as_deref(), Some("醫藥"));
}

#[tokio::test]
async fn test_login_rejections_surface_on_form() {
    let fixture = TestFixture::new().await;
    let session = SessionContext::new(fixture.backend(), None);

    let err = session.login("不存在的人", "A甲").await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownUser(_)));
    assert_eq!(
        err.surface(UserAction::Login),
        ErrorSurface::LoginForm {
            message: messages::UNKNOWN_USER.to_string()
        }
    );

    let err = session.login("方凱琪", "wrong").await.unwrap_err();
    assert_eq!(err, SyncError::InvalidCredentials);
    assert_eq!(
        err.surface(UserAction::Login).message(),
        Some(messages::INVALID_CREDENTIALS)
    );
    assert!(!session.is_logged_in());
}

#[tokio::test]
async fn test_session_survives_restart() {
    let fixture = TestFixture::new().await;

    let first = SessionContext::new(fixture.backend(), Some(fixture.config.session_path.clone()));
    first.login("江虹", "B乙").await.unwrap();
    assert!(fixture.config.session_path.exists());
    first.shutdown();

    let second = SessionContext::new(fixture.backend(), Some(fixture.config.session_path.clone()));
    let identity = second.restore().await.unwrap().expect("session not restored");

    assert_eq!(identity.id, "user-jianghong");
    assert_eq!(second.current_user().unwrap().role, Role::Reporter);
}

#[tokio::test]
async fn test_revoked_session_is_discarded() {
    let fixture = TestFixture::new().await;

    let first = SessionContext::new(fixture.backend(), Some(fixture.config.session_path.clone()));
    first.login("江虹", "B乙").await.unwrap();
    first.shutdown();

    // Revoke every token behind the client's back.
    fixture.stub.tokens.lock().unwrap().clear();
    fixture.stub.refresh_tokens.lock().unwrap().clear();

    let backend = fixture.backend();
    let second = SessionContext::new(backend.clone(), Some(fixture.config.session_path.clone()));

    assert_eq!(second.restore().await.unwrap(), None);
    assert!(!second.is_logged_in());
    assert!(backend.current_session().await.is_none());
    assert!(!fixture.config.session_path.exists());
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let fixture = TestFixture::new().await;
    let backend = fixture.backend();
    let session = SessionContext::new(backend.clone(), None);
    session.login("江虹", "B乙").await.unwrap();
    assert_eq!(fixture.stub.tokens.lock().unwrap().len(), 1);

    session.logout().await;

    assert!(!session.is_logged_in());
    assert!(backend.current_session().await.is_none());
    assert!(fixture.stub.tokens.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_in_background() {
    let fixture = TestFixture::new().await;
    fixture.stub.token_lifetime.store(2, Ordering::SeqCst);

    let backend = fixture.backend();
    let mut events = backend.auth_events();
    let session = SessionContext::new(backend.clone(), Some(fixture.config.session_path.clone()));
    session.watch();
    let mut users = session.subscribe();

    session.login("江虹", "B乙").await.unwrap();
    let first_token = backend.current_session().await.unwrap().access_token;

    // promoted while signed in: only a profile re-fetch can notice
    for row in fixture.stub.tables.lock().unwrap().entry("profiles".to_string()).or_default() {
        if row["id"] == "user-jianghong" {
            row["role"] = json!("Admin");
        }
    }

    let refreshed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let AuthEvent::TokenRefreshed(refreshed) = events.recv().await.unwrap() {
                return refreshed;
            }
        }
    })
    .await
    .expect("Token was not refreshed");
    assert_ne!(refreshed.access_token, first_token);
    assert_eq!(refreshed.user.id, "user-jianghong");

    tokio::time::timeout(Duration::from_secs(5), async {
        while users.borrow_and_update().as_ref().map(|user| user.role) != Some(Role::Admin) {
            users.changed().await.unwrap();
        }
    })
    .await
    .expect("Profile was not re-fetched");

    let persisted = std::fs::read_to_string(&fixture.config.session_path).unwrap();
    assert!(!persisted.contains(&first_token));

    session.logout().await;
    assert!(backend.current_session().await.is_none());
}

// ==================== ROW TESTS ====================

#[tokio::test]
async fn test_lead_gateway_round_trip() {
    let fixture = TestFixture::new().await;
    let session = fixture.login("江虹", "B乙").await;
    let gateway = LeadGateway::new(session.backend());

    let first = gateway
        .create(&NewLead {
            title: "舊線索".to_string(),
            ..NewLead::default()
        })
        .await
        .unwrap();
    let second = gateway
        .create(&NewLead {
            title: "新線索".to_string(),
            reporter: Reporter::JiangHong,
            ..NewLead::default()
        })
        .await
        .unwrap();
    assert_eq!(second.created_by, "user-jianghong");

    let listed = gateway.list().await.unwrap();
    let titles: Vec<&str> = listed.iter().map(|l| l.title.as_str()).collect();
    assert_eq!(titles, vec!["新線索", "舊線索"]);

    let patch = LeadPatch {
        status: Some(LeadStatus::WaitingReply),
        ..LeadPatch::default()
    };
    let updated = gateway.update(&first.id, &patch).await.unwrap();
    assert_eq!(updated.status, LeadStatus::WaitingReply);
    assert_eq!(updated.title, "舊線索");
    assert!(updated.updated_at >= first.updated_at);

    gateway.delete(&first.id).await.unwrap();
    assert_eq!(fixture.stub.rows("leads").len(), 1);
}

#[tokio::test]
async fn test_status_mapping_over_http() {
    let fixture = TestFixture::new().await;
    let session = fixture.login("江虹", "B乙").await;
    let gateway = LeadGateway::new(session.backend());

    let patch = LeadPatch {
        title: Some("不存在".to_string()),
        ..LeadPatch::default()
    };
    assert!(matches!(
        gateway.update("missing", &patch).await,
        Err(SyncError::NotFound(_))
    ));
    assert!(matches!(
        gateway.delete("missing").await,
        Err(SyncError::NotFound(_))
    ));

    // Writes with only the public key are refused by the row rules.
    let anonymous = fixture.backend();
    let err = anonymous
        .insert(crate::models::Table::Leads, json!({ "title": "匿名" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Permission(msg) if msg.contains("row-level security")));

    let mut keyless = fixture.config.clone();
    keyless.anon_key = Some("wrong-key".to_string());
    let rejected = RestBackend::new(&keyless).unwrap();
    assert!(matches!(
        rejected
            .select(&crate::backend::Select::all(crate::models::Table::Leads))
            .await,
        Err(SyncError::Auth(msg)) if msg == "No API key found in request"
    ));
}

#[tokio::test]
async fn test_user_directory_requires_admin() {
    let fixture = TestFixture::new().await;

    let admin = fixture.login("方凱琪", "A甲").await;
    let entries = UserDirectory::new(admin).list().await.unwrap();
    assert_eq!(entries.len(), 3);

    let newbie = entries
        .iter()
        .find(|e| e.email == "newbie@news.com")
        .unwrap();
    assert_eq!(newbie.full_name, "新同事");
    assert_eq!(newbie.role, Role::Reporter);
    let admin_entry = entries
        .iter()
        .find(|e| e.email == "fangkaiqi@news.com")
        .unwrap();
    assert_eq!(admin_entry.role, Role::Admin);
    assert!(admin_entry.last_sign_in_at.is_some());

    let reporter = fixture.login("江虹", "B乙").await;
    let err = UserDirectory::new(reporter).list().await.unwrap_err();
    assert_eq!(err, SyncError::Permission(messages::ADMIN_REQUIRED.to_string()));
}

// ==================== LIVE BOARD TESTS ====================

#[tokio::test]
async fn test_lead_created_once_and_reaches_other_client() {
    let fixture = TestFixture::new().await;
    let mut mine = LeadBoard::open(fixture.login("方凱琪", "A甲").await)
        .await
        .unwrap();
    let mut theirs = LeadBoard::open(fixture.login("江虹", "B乙").await)
        .await
        .unwrap();
    assert!(mine.leads().is_empty());

    let mut form = mine.form_for(None);
    form.title = "測試線索".to_string();
    let lead = mine.save(None, form).await.unwrap();
    assert_eq!(mine.leads().len(), 1);

    // Our own insert comes back on the change stream and must not duplicate the row.
    wait_for_change(&mut theirs, &lead.id).await;
    let _ = tokio::time::timeout(Duration::from_millis(300), mine.next_event()).await;
    assert_eq!(mine.leads().len(), 1);
    assert_eq!(theirs.get(&lead.id).unwrap(), &lead);

    let mut form = mine.form_for(Some(&lead.id));
    form.status = LeadStatus::Accepted;
    mine.save(Some(&lead.id), form).await.unwrap();
    wait_for_change(&mut theirs, &lead.id).await;
    assert_eq!(theirs.get(&lead.id).unwrap().status, LeadStatus::Accepted);

    mine.delete(&lead.id).unwrap();
    wait_for_change(&mut theirs, &lead.id).await;
    assert!(theirs.get(&lead.id).is_none());
    assert!(fixture.stub.rows("leads").is_empty());
}
