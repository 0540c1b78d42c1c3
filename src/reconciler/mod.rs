//! Optimistic view reconciler.
//!
//! [`Collection`] is the in-memory ordered view a page owns. It takes three kinds of input:
//! local optimistic edits, settled gateway results, and change notifications. These may
//! arrive in any order relative to each other.
//!
//! Merge rules:
//! - a row is kept only if it is at least as new (`updated_at`) as the one shown, so applying
//!   the same state twice, or in either order, leaves the view unchanged;
//! - deleted ids are tombstoned and never resurrected by late inserts or updates; a tombstone
//!   is retired once a fresh listing no longer contains the id and no local delete of it is
//!   pending, so the set stays bounded by what the service still lists;
//! - while a local edit is pending, newer remote state is stored as the rollback base instead
//!   of overwriting the edit;
//! - inserts land at the kind's sort position, updates keep their position.
//!
//! INVARIANT: entries ∩ tombstones = ∅

mod filter;

pub use filter::*;

use std::collections::{HashMap, HashSet};

use crate::models::Record;

/// Where a row stands relative to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Local edit applied, gateway result pending
    Tentative,
    /// Reflects a gateway result or an accepted notification
    Confirmed,
    /// A failed local edit was undone
    RolledBack,
}

/// Ticket for one pending optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u64);

/// What happened to the view after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Replaced,
    Removed,
    /// Input was stale, duplicate or about a deleted row
    Ignored,
}

impl Outcome {
    pub fn changed(&self) -> bool {
        *self != Outcome::Ignored
    }
}

#[derive(Debug, Clone)]
struct Entry<R> {
    record: R,
    status: EntryStatus,
    /// Latest confirmed state while a local edit is pending
    base: Option<R>,
    op: Option<OpId>,
}

#[derive(Debug, Clone)]
struct PendingDelete<R> {
    op: OpId,
    index: usize,
    entry: Entry<R>,
}

/// Ordered, id-keyed collection of one record kind.
#[derive(Debug, Clone)]
pub struct Collection<R: Record> {
    entries: Vec<Entry<R>>,
    tombstones: HashSet<String>,
    pending_deletes: HashMap<String, PendingDelete<R>>,
    next_op: u64,
}

impl<R: Record> Default for Collection<R> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            tombstones: HashSet::new(),
            pending_deletes: HashMap::new(),
            next_op: 0,
        }
    }
}

impl<R: Record> Collection<R> {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== READS ====================

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.position(id).map(|i| &self.entries[i].record)
    }

    pub fn status(&self, id: &str) -> Option<EntryStatus> {
        self.position(id).map(|i| self.entries[i].status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Snapshot of the displayed rows, in display order.
    pub fn records(&self) -> Vec<R> {
        self.iter().cloned().collect()
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_deletes.is_empty() || self.entries.iter().any(|e| e.op.is_some())
    }

    // ==================== LOAD ====================

    /// Replace the view with a fresh listing. Tombstoned ids stay hidden.
    pub fn replace_all(&mut self, records: Vec<R>) {
        {
            let listed: HashSet<&str> = records.iter().map(|r| r.id()).collect();
            let pending = &self.pending_deletes;
            let before = self.tombstones.len();
            self.tombstones
                .retain(|id| listed.contains(id.as_str()) || pending.contains_key(id));
            let retired = before - self.tombstones.len();
            if retired > 0 {
                tracing::debug!(table = %R::TABLE, retired, "Retired tombstones");
            }
        }

        let mut entries: Vec<Entry<R>> = records
            .into_iter()
            .filter(|r| !self.tombstones.contains(r.id()))
            .map(|record| Entry {
                record,
                status: EntryStatus::Confirmed,
                base: None,
                op: None,
            })
            .collect();
        entries.sort_by(|a, b| R::sort_cmp(&a.record, &b.record));
        self.entries = entries;
    }

    // ==================== REMOTE STATE ====================

    /// Merge a row from a gateway result or an insert/update notification.
    pub fn merge(&mut self, record: R) -> Outcome {
        let id = record.id().to_string();
        if self.tombstones.contains(&id) {
            if let Some(pending) = self.pending_deletes.get_mut(&id) {
                if record.updated_at() >= pending.entry.record.updated_at() {
                    pending.entry.record = record;
                }
            }
            return Outcome::Ignored;
        }

        let Some(index) = self.position(&id) else {
            self.insert_sorted(Entry {
                record,
                status: EntryStatus::Confirmed,
                base: None,
                op: None,
            });
            return Outcome::Inserted;
        };

        let entry = &mut self.entries[index];
        if entry.op.is_some() {
            let base = entry.base.get_or_insert_with(|| record.clone());
            if record.updated_at() >= base.updated_at() {
                *base = record;
            }
            return Outcome::Ignored;
        }

        if record.updated_at() < entry.record.updated_at() || record == entry.record {
            return Outcome::Ignored;
        }
        entry.record = record;
        entry.status = EntryStatus::Confirmed;
        Outcome::Replaced
    }

    /// Apply a delete notification, or the gateway reporting the row as gone.
    pub fn remove(&mut self, id: &str) -> Outcome {
        self.tombstones.insert(id.to_string());
        self.pending_deletes.remove(id);

        match self.position(id) {
            Some(index) => {
                self.entries.remove(index);
                Outcome::Removed
            }
            None => Outcome::Ignored,
        }
    }

    // ==================== LOCAL EDITS ====================

    /// Apply `patch` immediately. `None` if the row is not shown.
    pub fn begin_update(&mut self, id: &str, patch: &R::Patch) -> Option<OpId> {
        let index = self.position(id)?;
        let op = self.next_op();

        let entry = &mut self.entries[index];
        if entry.op.is_none() {
            entry.base = Some(entry.record.clone());
        }
        entry.record.apply_patch(patch);
        entry.status = EntryStatus::Tentative;
        entry.op = Some(op);
        Some(op)
    }

    /// Settle an update with the stored row the gateway returned.
    pub fn confirm_update(&mut self, op: OpId, record: R) -> Outcome {
        let id = record.id().to_string();
        let Some(index) = self.position(&id) else {
            return self.merge(record);
        };

        let entry = &mut self.entries[index];
        if entry.op != Some(op) {
            return self.merge(record);
        }

        let newest = match entry.base.take() {
            Some(base) if base.updated_at() > record.updated_at() => base,
            _ => record,
        };
        entry.record = newest;
        entry.status = EntryStatus::Confirmed;
        entry.op = None;
        Outcome::Replaced
    }

    /// Undo a failed update on that row only. A newer local edit wins over this rollback.
    pub fn rollback_update(&mut self, op: OpId, id: &str) -> Outcome {
        let Some(index) = self.position(id) else {
            return Outcome::Ignored;
        };

        let entry = &mut self.entries[index];
        if entry.op != Some(op) {
            return Outcome::Ignored;
        }

        if let Some(base) = entry.base.take() {
            entry.record = base;
        }
        entry.status = EntryStatus::RolledBack;
        entry.op = None;
        tracing::debug!(table = %R::TABLE, id = %id, "Rolled back local update");
        Outcome::Replaced
    }

    /// Hide the row immediately. `None` if the row is not shown.
    pub fn begin_delete(&mut self, id: &str) -> Option<OpId> {
        let index = self.position(id)?;
        let op = self.next_op();

        let mut entry = self.entries.remove(index);
        if let Some(base) = entry.base.take() {
            entry.record = base;
        }
        entry.op = None;
        entry.status = EntryStatus::Confirmed;

        self.tombstones.insert(id.to_string());
        self.pending_deletes
            .insert(id.to_string(), PendingDelete { op, index, entry });
        Some(op)
    }

    pub fn confirm_delete(&mut self, op: OpId, id: &str) -> Outcome {
        if self.pending_deletes.get(id).is_some_and(|p| p.op == op) {
            self.pending_deletes.remove(id);
        }
        self.remove(id)
    }

    /// Put a row back after its delete failed, where it was shown before.
    pub fn rollback_delete(&mut self, op: OpId, id: &str) -> Outcome {
        if !self.pending_deletes.get(id).is_some_and(|p| p.op == op) {
            return Outcome::Ignored;
        }
        let Some(pending) = self.pending_deletes.remove(id) else {
            return Outcome::Ignored;
        };

        self.tombstones.remove(id);
        let mut entry = pending.entry;
        entry.status = EntryStatus::RolledBack;
        let index = pending.index.min(self.entries.len());
        self.entries.insert(index, entry);
        tracing::debug!(table = %R::TABLE, id = %id, "Rolled back local delete");
        Outcome::Inserted
    }

    // ==================== INTERNALS ====================

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.record.id() == id)
    }

    fn insert_sorted(&mut self, entry: Entry<R>) {
        let index = self
            .entries
            .partition_point(|e| R::sort_cmp(&e.record, &entry.record).is_le());
        self.entries.insert(index, entry);
    }

    fn next_op(&mut self) -> OpId {
        self.next_op += 1;
        OpId(self.next_op)
    }
}
