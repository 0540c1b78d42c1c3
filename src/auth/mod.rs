//! Identity and access gate.
//!
//! Login by display name, the process-wide session context, local authorization checks and
//! the admin user directory.

pub mod access;
pub mod directory;
pub mod session;

pub use access::{can_edit_or_delete, can_mutate_event, require_admin};
pub use directory::{DirectoryEntry, DirectorySearch, RoleCounts, UserDirectory};
pub use session::{Identity, SessionContext};
