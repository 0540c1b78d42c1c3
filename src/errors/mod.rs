//! Error handling module for the newsroom board.
//!
//! Provides the crate error taxonomy and its mapping to the surfaces a page shows the user.

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UNKNOWN_USER: &str = "UNKNOWN_USER";
    pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// User-facing messages shown by the pages and the login form.
pub mod messages {
    pub const LOAD_LEADS_FAILED: &str = "載入資料時發生錯誤";
    pub const SAVE_LEAD_FAILED: &str = "儲存時發生錯誤";
    pub const DELETE_LEAD_FAILED: &str = "刪除時發生錯誤";
    pub const LOAD_EVENTS_FAILED: &str = "載入事件時發生錯誤";
    pub const SAVE_EVENT_FAILED: &str = "儲存事件時發生錯誤";
    pub const DELETE_EVENT_FAILED: &str = "刪除事件時發生錯誤";
    pub const MOVE_EVENT_FAILED: &str = "更新事件時發生錯誤";
    pub const UNKNOWN_USER: &str = "找不到該使用者名稱";
    pub const INVALID_CREDENTIALS: &str = "使用者名稱或密碼錯誤";
    pub const LOGIN_FAILED: &str = "登入時發生錯誤";
    pub const ACCESS_DENIED: &str = "您沒有權限執行此操作";
    pub const ADMIN_REQUIRED: &str = "您需要管理員權限才能查看此頁面";
}

/// Crate error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network failure or the hosted service is unreachable
    Transport(String),
    /// No authenticated identity, or the token was rejected
    Auth(String),
    /// Authenticated, but not allowed to touch the row
    Permission(String),
    /// Target row does not exist (anymore)
    NotFound(String),
    /// Payload rejected, either locally or by the service
    Validation(String),
    /// Display name has no matching profile
    UnknownUser(String),
    /// Password did not match
    InvalidCredentials,
    /// Bad configuration value
    Config(String),
    /// Anything else (undecodable payloads, I/O)
    Internal(String),
}

impl SyncError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => codes::TRANSPORT_ERROR,
            SyncError::Auth(_) => codes::UNAUTHORIZED,
            SyncError::Permission(_) => codes::FORBIDDEN,
            SyncError::NotFound(_) => codes::NOT_FOUND,
            SyncError::Validation(_) => codes::VALIDATION_ERROR,
            SyncError::UnknownUser(_) => codes::UNKNOWN_USER,
            SyncError::InvalidCredentials => codes::INVALID_CREDENTIALS,
            SyncError::Config(_) => codes::CONFIG_ERROR,
            SyncError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            SyncError::Transport(msg) => msg.clone(),
            SyncError::Auth(msg) => msg.clone(),
            SyncError::Permission(msg) => msg.clone(),
            SyncError::NotFound(msg) => msg.clone(),
            SyncError::Validation(msg) => msg.clone(),
            SyncError::UnknownUser(name) => format!("No profile named {}", name),
            SyncError::InvalidCredentials => "Invalid login credentials".to_string(),
            SyncError::Config(msg) => msg.clone(),
            SyncError::Internal(msg) => msg.clone(),
        }
    }

    /// Map this error to what the page shows for the given user action.
    pub fn surface(&self, action: UserAction) -> ErrorSurface {
        match self {
            SyncError::NotFound(_) => ErrorSurface::Silent,
            SyncError::Auth(_) | SyncError::Permission(_) => ErrorSurface::AccessDenied {
                message: messages::ACCESS_DENIED.to_string(),
            },
            SyncError::Validation(msg) => ErrorSurface::Inline {
                message: msg.clone(),
            },
            SyncError::UnknownUser(_) => ErrorSurface::LoginForm {
                message: messages::UNKNOWN_USER.to_string(),
            },
            SyncError::InvalidCredentials => ErrorSurface::LoginForm {
                message: messages::INVALID_CREDENTIALS.to_string(),
            },
            SyncError::Transport(_) | SyncError::Config(_) | SyncError::Internal(_) => {
                if action == UserAction::Login {
                    return ErrorSurface::LoginForm {
                        message: messages::LOGIN_FAILED.to_string(),
                    };
                }
                ErrorSurface::Banner {
                    message: action.failure_message().to_string(),
                    recovery: action.recovery(),
                }
            }
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for SyncError {}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!("Transport error: {:?}", err);
        if err.is_decode() {
            return SyncError::Internal(format!("Undecodable response: {}", err));
        }
        SyncError::Transport(format!("Transport error: {}", err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        SyncError::Internal(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        tracing::error!("I/O error: {:?}", err);
        SyncError::Internal(format!("I/O error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        tracing::error!("Realtime socket error: {:?}", err);
        SyncError::Transport(format!("Realtime socket error: {}", err))
    }
}

/// The user action that triggered a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    LoadLeads,
    SaveLead,
    DeleteLead,
    LoadEvents,
    SaveEvent,
    DeleteEvent,
    MoveEvent,
    Login,
}

impl UserAction {
    pub fn failure_message(&self) -> &'static str {
        match self {
            UserAction::LoadLeads => messages::LOAD_LEADS_FAILED,
            UserAction::SaveLead => messages::SAVE_LEAD_FAILED,
            UserAction::DeleteLead => messages::DELETE_LEAD_FAILED,
            UserAction::LoadEvents => messages::LOAD_EVENTS_FAILED,
            UserAction::SaveEvent => messages::SAVE_EVENT_FAILED,
            UserAction::DeleteEvent => messages::DELETE_EVENT_FAILED,
            UserAction::MoveEvent => messages::MOVE_EVENT_FAILED,
            UserAction::Login => messages::LOGIN_FAILED,
        }
    }

    /// Dialog saves are retried by the user; everything else offers a reload.
    pub fn recovery(&self) -> Recovery {
        match self {
            UserAction::SaveLead | UserAction::SaveEvent => Recovery::Retry,
            _ => Recovery::Reload,
        }
    }
}

/// What the user can do about a banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Reload,
    Retry,
}

/// How an error is presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSurface {
    /// Page-level banner with a manual recovery action
    Banner { message: String, recovery: Recovery },
    /// Access-denied messaging; the session is kept
    AccessDenied { message: String },
    /// Shown next to the form field; the dialog stays open
    Inline { message: String },
    /// Shown in the login form only
    LoginForm { message: String },
    /// Nothing is shown
    Silent,
}

impl ErrorSurface {
    pub fn message(&self) -> Option<&str> {
        match self {
            ErrorSurface::Banner { message, .. }
            | ErrorSurface::AccessDenied { message }
            | ErrorSurface::Inline { message }
            | ErrorSurface::LoginForm { message } => Some(message),
            ErrorSurface::Silent => None,
        }
    }
}
