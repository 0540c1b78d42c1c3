//! Local authorization checks.
//!
//! These only decide which edit affordances a page offers. The hosted service enforces row
//! access on its own.

use crate::errors::{messages, SyncError};
use crate::models::{CurrentUser, Event, Lead, Role};

/// Admins and editors may edit or delete any lead; reporters only the leads they created.
pub fn can_edit_or_delete(lead: &Lead, user: Option<&CurrentUser>) -> bool {
    let Some(user) = user else {
        return false;
    };
    match user.role {
        Role::Admin | Role::Editor => true,
        Role::Reporter => lead.created_by == user.id,
    }
}

/// Any signed-in user may change any event.
pub fn can_mutate_event(_event: &Event, user: Option<&CurrentUser>) -> bool {
    user.is_some()
}

/// Gate for admin-only screens.
pub fn require_admin(user: Option<&CurrentUser>) -> Result<&CurrentUser, SyncError> {
    match user {
        Some(user) if user.role == Role::Admin => Ok(user),
        _ => Err(SyncError::Permission(messages::ADMIN_REQUIRED.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LeadStatus, Reporter, Section, UserProfile};
    use chrono::{TimeZone, Utc};

    fn user(id: &str, role: Role) -> CurrentUser {
        CurrentUser::from_profile(UserProfile {
            id: id.to_string(),
            email: format!("{}@news.com", id),
            full_name: id.to_string(),
            role,
            sports_section: None,
            knowledge_section: None,
            password_code: String::new(),
            created_at: None,
            updated_at: None,
        })
    }

    fn lead_by(creator: &str) -> Lead {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        Lead {
            id: "l1".to_string(),
            title: "測試線索".to_string(),
            status: LeadStatus::NotPreCollected,
            reporter: Reporter::JiangHong,
            issue_number: 1820,
            section: Section::Knowledge,
            links: Vec::new(),
            created_at: now,
            updated_at: now,
            created_by: creator.to_string(),
        }
    }

    #[test]
    fn test_lead_edit_matrix() {
        let lead = lead_by("alice");
        let cases = [
            (Role::Admin, "bob", true),
            (Role::Editor, "bob", true),
            (Role::Reporter, "alice", true),
            (Role::Reporter, "bob", false),
        ];

        for (role, id, expected) in cases {
            assert_eq!(
                can_edit_or_delete(&lead, Some(&user(id, role))),
                expected,
                "{:?} {}",
                role,
                id
            );
        }
        assert!(!can_edit_or_delete(&lead, None));
    }

    #[test]
    fn test_require_admin() {
        let admin = user("root", Role::Admin);
        let editor = user("ed", Role::Editor);

        assert!(require_admin(Some(&admin)).is_ok());
        assert_eq!(
            require_admin(Some(&editor)).unwrap_err(),
            SyncError::Permission(messages::ADMIN_REQUIRED.to_string())
        );
        assert!(require_admin(None).is_err());
    }
}
