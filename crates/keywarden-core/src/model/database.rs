//! The in-memory database: metadata, group tree, deletion tombstones.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::entry::Entry;
use super::group::Group;
use super::meta::Meta;
use super::times;

/// KDBX compression algorithm ids (4-byte LE enum on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
}

impl CompressionAlgorithm {
    pub fn id(self) -> u32 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Gzip => 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Gzip),
            _ => None,
        }
    }
}

pub const DEFAULT_TRANSFORM_ROUNDS: u64 = 6000;

/// Container parameters persisted across saves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub cipher_uuid: Uuid,
    pub compression: CompressionAlgorithm,
    pub transform_rounds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cipher_uuid: crate::format::cipher::AES_CIPHER_UUID,
            compression: CompressionAlgorithm::Gzip,
            transform_rounds: DEFAULT_TRANSFORM_ROUNDS,
        }
    }
}

/// Tombstone for a permanently deleted object. Retained so a later merge can
/// tell an intentional removal apart from an object the other replica never
/// had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

pub const RECYCLE_BIN_NAME: &str = "Recycle Bin";
pub const RECYCLE_BIN_ICON: u32 = 43;

#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub meta: Meta,
    pub settings: Settings,
    pub root: Group,
    pub deleted_objects: Vec<DeletedObject>,
}

/// Summary counters for diagnostics and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub name: String,
    pub groups: usize,
    pub entries: usize,
    pub history_entries: usize,
    pub custom_icons: usize,
    pub tombstones: usize,
    pub expired_entries: usize,
}

impl Database {
    pub fn new(name: &str) -> Self {
        Self {
            meta: Meta::new(name),
            settings: Settings::default(),
            root: Group::new(name),
            deleted_objects: Vec::new(),
        }
    }

    // ── Lookups (relations, not ownership) ──────────────────────────────

    pub fn find_group(&self, uuid: Uuid) -> Option<&Group> {
        fn walk(g: &Group, uuid: Uuid) -> Option<&Group> {
            if g.uuid == uuid {
                return Some(g);
            }
            g.groups.iter().find_map(|c| walk(c, uuid))
        }
        walk(&self.root, uuid)
    }

    pub fn find_group_mut(&mut self, uuid: Uuid) -> Option<&mut Group> {
        fn walk(g: &mut Group, uuid: Uuid) -> Option<&mut Group> {
            if g.uuid == uuid {
                return Some(g);
            }
            g.groups.iter_mut().find_map(|c| walk(c, uuid))
        }
        walk(&mut self.root, uuid)
    }

    pub fn find_entry(&self, uuid: Uuid) -> Option<&Entry> {
        fn walk(g: &Group, uuid: Uuid) -> Option<&Entry> {
            if let Some(e) = g.entries.iter().find(|e| e.uuid == uuid) {
                return Some(e);
            }
            g.groups.iter().find_map(|c| walk(c, uuid))
        }
        walk(&self.root, uuid)
    }

    pub fn find_entry_mut(&mut self, uuid: Uuid) -> Option<&mut Entry> {
        fn walk(g: &mut Group, uuid: Uuid) -> Option<&mut Entry> {
            if let Some(i) = g.entries.iter().position(|e| e.uuid == uuid) {
                return Some(&mut g.entries[i]);
            }
            g.groups.iter_mut().find_map(|c| walk(c, uuid))
        }
        walk(&mut self.root, uuid)
    }

    /// The group whose entry list currently contains `uuid`.
    pub fn parent_of_entry(&self, uuid: Uuid) -> Option<&Group> {
        fn walk(g: &Group, uuid: Uuid) -> Option<&Group> {
            if g.entries.iter().any(|e| e.uuid == uuid) {
                return Some(g);
            }
            g.groups.iter().find_map(|c| walk(c, uuid))
        }
        walk(&self.root, uuid)
    }

    /// The group whose child list currently contains `uuid`; `None` for the
    /// root and for unknown UUIDs.
    pub fn parent_of_group(&self, uuid: Uuid) -> Option<&Group> {
        fn walk(g: &Group, uuid: Uuid) -> Option<&Group> {
            if g.groups.iter().any(|c| c.uuid == uuid) {
                return Some(g);
            }
            g.groups.iter().find_map(|c| walk(c, uuid))
        }
        walk(&self.root, uuid)
    }

    // ── Structural mutation ─────────────────────────────────────────────

    /// Remove and return the entry with `uuid`, wherever it lives.
    pub fn take_entry(&mut self, uuid: Uuid) -> Option<Entry> {
        fn walk(g: &mut Group, uuid: Uuid) -> Option<Entry> {
            if let Some(i) = g.entries.iter().position(|e| e.uuid == uuid) {
                return Some(g.entries.remove(i));
            }
            g.groups.iter_mut().find_map(|c| walk(c, uuid))
        }
        walk(&mut self.root, uuid)
    }

    /// Remove and return the group with `uuid` (and its whole subtree). The
    /// root cannot be taken.
    pub fn take_group(&mut self, uuid: Uuid) -> Option<Group> {
        fn walk(g: &mut Group, uuid: Uuid) -> Option<Group> {
            if let Some(i) = g.groups.iter().position(|c| c.uuid == uuid) {
                return Some(g.groups.remove(i));
            }
            g.groups.iter_mut().find_map(|c| walk(c, uuid))
        }
        walk(&mut self.root, uuid)
    }

    /// Append `entry` to the group `parent`, falling back to the root when
    /// the parent is unknown. Returns the owning group's UUID.
    pub fn add_entry(&mut self, parent: Option<Uuid>, entry: Entry) -> Uuid {
        let target = parent
            .and_then(|p| self.find_group_mut(p).map(|g| g.uuid))
            .unwrap_or(self.root.uuid);
        self.find_group_mut(target)
            .expect("target group exists")
            .entries
            .push(entry);
        target
    }

    /// Move an entry under another group, stamping `location_changed`.
    /// Returns false when either side is unknown.
    pub fn relocate_entry(&mut self, uuid: Uuid, new_parent: Uuid) -> bool {
        if self.find_group(new_parent).is_none() {
            return false;
        }
        let Some(mut entry) = self.take_entry(uuid) else {
            return false;
        };
        entry.times.location_changed = times::now();
        self.find_group_mut(new_parent)
            .expect("checked above")
            .entries
            .push(entry);
        true
    }

    /// Move a group under another group. Refuses to create a cycle.
    pub fn relocate_group(&mut self, uuid: Uuid, new_parent: Uuid) -> bool {
        let Some(moving) = self.find_group(uuid) else {
            return false;
        };
        if moving.contains_group(new_parent) || self.find_group(new_parent).is_none() {
            return false;
        }
        let Some(mut group) = self.take_group(uuid) else {
            return false;
        };
        group.times.location_changed = times::now();
        self.find_group_mut(new_parent)
            .expect("checked above")
            .groups
            .push(group);
        true
    }

    // ── Deletion ────────────────────────────────────────────────────────

    /// Locate (or create) the recycle bin group.
    pub fn ensure_recycle_bin(&mut self) -> Uuid {
        if let Some(uuid) = self.meta.recycle_bin_uuid {
            if self.find_group(uuid).is_some() {
                return uuid;
            }
        }
        let mut bin = Group::new(RECYCLE_BIN_NAME);
        bin.icon_id = RECYCLE_BIN_ICON;
        bin.is_expanded = false;
        let uuid = bin.uuid;
        self.root.groups.push(bin);
        self.meta.recycle_bin_uuid = Some(uuid);
        self.meta.recycle_bin_changed = times::now();
        uuid
    }

    /// Whether `uuid` currently lives under the recycle bin.
    pub fn is_in_recycle_bin(&self, uuid: Uuid) -> bool {
        let Some(bin) = self.meta.recycle_bin_uuid.and_then(|b| self.find_group(b)) else {
            return false;
        };
        let mut found = false;
        bin.for_each_entry(&mut |e| found |= e.uuid == uuid);
        found || (bin.uuid != uuid && bin.contains_group(uuid))
    }

    /// Delete an entry. A permanent delete (or a delete while the recycle
    /// bin is disabled or already holds the entry) records a tombstone; a
    /// soft delete reparents into the recycle bin. Never both.
    pub fn delete_entry(&mut self, uuid: Uuid) -> bool {
        let permanent =
            !self.meta.recycle_bin_enabled || self.is_in_recycle_bin(uuid);
        if permanent {
            if self.take_entry(uuid).is_none() {
                return false;
            }
            self.add_tombstone(uuid, times::now());
            true
        } else {
            if self.find_entry(uuid).is_none() {
                return false;
            }
            let bin = self.ensure_recycle_bin();
            self.relocate_entry(uuid, bin)
        }
    }

    /// Delete a group and its subtree, with the same soft/permanent split as
    /// [`Database::delete_entry`]. The root group cannot be deleted.
    pub fn delete_group(&mut self, uuid: Uuid) -> bool {
        if uuid == self.root.uuid {
            return false;
        }
        let permanent =
            !self.meta.recycle_bin_enabled || self.is_in_recycle_bin(uuid);
        if permanent {
            let Some(group) = self.take_group(uuid) else {
                return false;
            };
            let now = times::now();
            let mut uuids = Vec::new();
            collect_uuids(&group, &mut uuids);
            for id in uuids {
                self.add_tombstone(id, now);
            }
            true
        } else {
            if self.meta.recycle_bin_uuid == Some(uuid) {
                return false;
            }
            let bin = self.ensure_recycle_bin();
            self.relocate_group(uuid, bin)
        }
    }

    pub fn tombstone_for(&self, uuid: Uuid) -> Option<&DeletedObject> {
        self.deleted_objects.iter().find(|d| d.uuid == uuid)
    }

    /// Record a tombstone, keeping only the newest deletion time per UUID.
    pub fn add_tombstone(&mut self, uuid: Uuid, deletion_time: DateTime<Utc>) {
        match self.deleted_objects.iter_mut().find(|d| d.uuid == uuid) {
            Some(existing) => {
                if deletion_time > existing.deletion_time {
                    existing.deletion_time = deletion_time;
                }
            }
            None => self.deleted_objects.push(DeletedObject {
                uuid,
                deletion_time,
            }),
        }
    }

    pub fn remove_tombstone(&mut self, uuid: Uuid) {
        self.deleted_objects.retain(|d| d.uuid != uuid);
    }

    /// Drop tombstones older than the configured horizon.
    pub fn prune_tombstones(&mut self, horizon: DateTime<Utc>) {
        self.deleted_objects.retain(|d| d.deletion_time >= horizon);
    }

    // ── Touch ───────────────────────────────────────────────────────────

    /// Touch the object with `uuid` and, when `touch_parents`, every group
    /// on the path above it.
    pub fn touch_path(&mut self, uuid: Uuid, modified: bool, touch_parents: bool) -> bool {
        fn walk(g: &mut Group, uuid: Uuid, modified: bool, parents: bool) -> bool {
            if g.uuid == uuid {
                g.touch(modified);
                return true;
            }
            if let Some(e) = g.entries.iter_mut().find(|e| e.uuid == uuid) {
                e.touch(modified);
                if parents {
                    g.touch(modified);
                }
                return true;
            }
            for child in &mut g.groups {
                if walk(child, uuid, modified, parents) {
                    if parents {
                        g.touch(modified);
                    }
                    return true;
                }
            }
            false
        }
        walk(&mut self.root, uuid, modified, touch_parents)
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn entry_count(&self) -> usize {
        self.root.entry_count()
    }

    pub fn group_count(&self) -> usize {
        self.root.group_count()
    }

    pub fn stats(&self) -> DatabaseStats {
        let mut history = 0;
        let mut expired = 0;
        let now = times::now();
        self.root.for_each_entry(&mut |e| {
            history += e.history.len();
            if e.is_expired(now) {
                expired += 1;
            }
        });
        DatabaseStats {
            name: self.meta.database_name.clone(),
            groups: self.group_count(),
            entries: self.entry_count(),
            history_entries: history,
            custom_icons: self.meta.custom_icons.len(),
            tombstones: self.deleted_objects.len(),
            expired_entries: expired,
        }
    }
}

fn collect_uuids(group: &Group, out: &mut Vec<Uuid>) {
    out.push(group.uuid);
    for e in &group.entries {
        out.push(e.uuid);
    }
    for g in &group.groups {
        collect_uuids(g, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> (Database, Uuid, Uuid) {
        let mut db = Database::new("Test");
        let mut sub = Group::new("Email");
        let entry = Entry::new();
        let entry_uuid = entry.uuid;
        sub.entries.push(entry);
        let sub_uuid = sub.uuid;
        db.root.groups.push(sub);
        (db, sub_uuid, entry_uuid)
    }

    #[test]
    fn lookups_resolve_relations() {
        let (db, sub_uuid, entry_uuid) = sample_db();
        assert_eq!(db.find_group(sub_uuid).unwrap().name, "Email");
        assert!(db.find_entry(entry_uuid).is_some());
        assert_eq!(db.parent_of_entry(entry_uuid).unwrap().uuid, sub_uuid);
        assert_eq!(db.parent_of_group(sub_uuid).unwrap().uuid, db.root.uuid);
        assert!(db.parent_of_group(db.root.uuid).is_none());
    }

    #[test]
    fn soft_delete_moves_to_recycle_bin_without_tombstone() {
        let (mut db, _, entry_uuid) = sample_db();
        assert!(db.delete_entry(entry_uuid));
        let bin = db.meta.recycle_bin_uuid.expect("bin created");
        assert_eq!(db.parent_of_entry(entry_uuid).unwrap().uuid, bin);
        assert!(db.tombstone_for(entry_uuid).is_none());
    }

    #[test]
    fn deleting_from_recycle_bin_is_permanent() {
        let (mut db, _, entry_uuid) = sample_db();
        db.delete_entry(entry_uuid);
        assert!(db.delete_entry(entry_uuid));
        assert!(db.find_entry(entry_uuid).is_none());
        assert!(db.tombstone_for(entry_uuid).is_some());
    }

    #[test]
    fn disabled_recycle_bin_means_permanent_delete() {
        let (mut db, _, entry_uuid) = sample_db();
        db.meta.recycle_bin_enabled = false;
        assert!(db.delete_entry(entry_uuid));
        assert!(db.find_entry(entry_uuid).is_none());
        assert!(db.tombstone_for(entry_uuid).is_some());
    }

    #[test]
    fn group_delete_tombstones_whole_subtree() {
        let (mut db, sub_uuid, entry_uuid) = sample_db();
        db.meta.recycle_bin_enabled = false;
        assert!(db.delete_group(sub_uuid));
        assert!(db.tombstone_for(sub_uuid).is_some());
        assert!(db.tombstone_for(entry_uuid).is_some());
    }

    #[test]
    fn relocate_group_refuses_cycles() {
        let (mut db, sub_uuid, _) = sample_db();
        let inner = Group::new("Inner");
        let inner_uuid = inner.uuid;
        db.find_group_mut(sub_uuid).unwrap().groups.push(inner);
        assert!(!db.relocate_group(sub_uuid, inner_uuid));
        assert!(db.relocate_group(inner_uuid, db.root.uuid));
    }

    #[test]
    fn touch_path_reaches_ancestors() {
        let (mut db, sub_uuid, entry_uuid) = sample_db();
        let past = times::now() - chrono::Duration::days(1);
        db.find_group_mut(sub_uuid).unwrap().times.last_access = past;
        assert!(db.touch_path(entry_uuid, true, true));
        let sub = db.find_group(sub_uuid).unwrap();
        assert!(sub.times.last_access > past);
        assert_eq!(sub.times.usage_count, 1);
        // Root is on the path too.
        assert_eq!(db.root.times.usage_count, 1);
    }

    #[test]
    fn tombstones_keep_newest_deletion_time() {
        let (mut db, _, entry_uuid) = sample_db();
        let t1 = times::now();
        let t2 = t1 + chrono::Duration::seconds(60);
        db.add_tombstone(entry_uuid, t2);
        db.add_tombstone(entry_uuid, t1);
        assert_eq!(db.deleted_objects.len(), 1);
        assert_eq!(db.tombstone_for(entry_uuid).unwrap().deletion_time, t2);
    }
}
