//! Admin user directory: every identity joined with its profile row.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::access::require_admin;
use super::session::SessionContext;
use crate::backend::{AuthUser, Select};
use crate::errors::SyncError;
use crate::models::{Role, Table, UserProfile};
use crate::reconciler::ViewFilter;

/// Shown for a profile field that was never filled in.
pub const NOT_SET: &str = "未設定";
/// Shown for an identity without a sign-in.
pub const NEVER_SIGNED_IN: &str = "從未登入";

/// One row of the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub sports_section: String,
    pub knowledge_section: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_sign_in_at: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    fn merge(user: AuthUser, profile: Option<&UserProfile>) -> Self {
        let metadata_name = user
            .user_metadata
            .get("full_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let full_name = profile
            .map(|p| p.full_name.clone())
            .filter(|name| !name.is_empty())
            .or(metadata_name)
            .unwrap_or_else(|| NOT_SET.to_string());

        let section = |value: Option<&Option<String>>| {
            value
                .and_then(|v| v.clone())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| NOT_SET.to_string())
        };

        Self {
            email: user.email.unwrap_or_default(),
            full_name,
            role: profile.map(|p| p.role).unwrap_or(Role::Reporter),
            sports_section: section(profile.map(|p| &p.sports_section)),
            knowledge_section: section(profile.map(|p| &p.knowledge_section)),
            created_at: user.created_at,
            last_sign_in_at: user.last_sign_in_at,
            id: user.id,
        }
    }

    /// Last sign-in for display.
    pub fn last_sign_in_label(&self) -> String {
        self.last_sign_in_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| NEVER_SIGNED_IN.to_string())
    }
}

/// Number of users per role, as shown in the directory header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub admins: usize,
    pub editors: usize,
    pub reporters: usize,
}

impl RoleCounts {
    pub fn tally(entries: &[DirectoryEntry]) -> Self {
        entries.iter().fold(Self::default(), |mut counts, entry| {
            match entry.role {
                Role::Admin => counts.admins += 1,
                Role::Editor => counts.editors += 1,
                Role::Reporter => counts.reporters += 1,
            }
            counts
        })
    }
}

/// Directory search box: case-insensitive match on name, e-mail or role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySearch {
    term: String,
}

impl DirectorySearch {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into().to_lowercase(),
        }
    }
}

impl ViewFilter<DirectoryEntry> for DirectorySearch {
    fn matches(&self, entry: &DirectoryEntry) -> bool {
        entry.full_name.to_lowercase().contains(&self.term)
            || entry.email.to_lowercase().contains(&self.term)
            || entry.role.as_str().to_lowercase().contains(&self.term)
    }
}

pub struct UserDirectory {
    session: Arc<SessionContext>,
}

impl UserDirectory {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self { session }
    }

    /// All identities with their profiles. Admin only.
    pub async fn list(&self) -> Result<Vec<DirectoryEntry>, SyncError> {
        let current = self.session.current_user();
        require_admin(current.as_ref())?;

        let backend = self.session.backend();
        let users = backend.admin_list_users().await?;

        let profiles: HashMap<String, UserProfile> = match backend
            .select(&Select::all(Table::Profiles))
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| serde_json::from_value::<UserProfile>(row).ok())
                .map(|profile| (profile.id.clone(), profile))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Profiles unavailable; listing identities only");
                HashMap::new()
            }
        };

        let entries: Vec<DirectoryEntry> = users
            .into_iter()
            .map(|user| {
                let profile = profiles.get(&user.id);
                DirectoryEntry::merge(user, profile)
            })
            .collect();

        tracing::info!(count = entries.len(), "Listed users");
        Ok(entries)
    }
}
