//! User profile model and authorization roles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authorization role, increasing in privilege.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    #[serde(alias = "reporter")]
    Reporter,
    #[serde(alias = "editor")]
    Editor,
    #[serde(alias = "admin")]
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Editor => "Editor",
            Role::Reporter => "Reporter",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `profiles` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    /// Display name users log in with
    pub full_name: String,
    pub role: Role,
    #[serde(default)]
    pub sports_section: Option<String>,
    #[serde(default)]
    pub knowledge_section: Option<String>,
    /// Short code the account password is derived from
    #[serde(default)]
    pub password_code: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The authenticated user as the pages see it.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub profile: UserProfile,
}

impl CurrentUser {
    pub fn from_profile(profile: UserProfile) -> Self {
        Self {
            id: profile.id.clone(),
            email: profile.email.clone(),
            name: profile.full_name.clone(),
            role: profile.role,
            profile,
        }
    }
}
