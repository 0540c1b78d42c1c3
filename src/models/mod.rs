//! Data models for the newsroom board.
//!
//! Field names match the hosted service's table columns so rows decode without mapping.

mod event;
mod lead;
mod profile;
mod reporter;

pub use event::*;
pub use lead::*;
pub use profile::*;
pub use reporter::*;

use std::cmp::Ordering;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::SyncError;

/// Tables of the hosted row store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    Leads,
    Events,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Leads => "leads",
            Table::Events => "events",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "profiles" => Some(Table::Profiles),
            "leads" => Some(Table::Leads),
            "events" => Some(Table::Events),
            _ => None,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort key used when listing a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: &'static str,
    pub ascending: bool,
}

/// A row kind the board keeps a live collection of.
pub trait Record: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Create payload: every field except id, timestamps and creator.
    type Draft: Serialize + Clone + Debug + Send + Sync + 'static;
    /// Partial update payload.
    type Patch: Serialize + Clone + Debug + Send + Sync + 'static;

    const TABLE: Table;
    const SORT: SortKey;

    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
    fn created_by(&self) -> &str;
    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Order of `list()` results, and where inserted rows land.
    fn sort_cmp(a: &Self, b: &Self) -> Ordering;

    /// Client-side checks run before anything is sent.
    fn validate(&self) -> Result<(), SyncError> {
        Ok(())
    }

    /// Row that a given draft would produce, used to validate drafts with the same rules.
    fn preview(draft: &Self::Draft) -> Self;
}
