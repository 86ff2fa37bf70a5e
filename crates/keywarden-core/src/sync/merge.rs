//! Merge engine: reconcile two trees of the same logical database.
//!
//! Identity is the UUID; conflicts resolve by modification timestamp with
//! the destination authoritative on exact ties (merging a tree into itself
//! is a no-op). A losing version is preserved in the winner's history, so
//! no edit is ever silently discarded. Deletion tombstones propagate, but a
//! modification after the deletion time wins over the delete.
//!
//! The engine never fails for data-content reasons; a cancelled run returns
//! early with the destination consistent and the merge re-runnable.

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::model::database::Database;
use crate::model::entry::{CompareOptions, Entry};
use crate::model::group::Group;
use crate::status::StatusLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    /// Relabel every incoming object with a fresh UUID before adoption.
    /// For sources that cannot supply stable identities.
    CreateNewUuids,
    /// One-way adoption of objects absent locally; local objects are left
    /// untouched and deletions are not applied.
    KeepExisting,
    /// Full two-way reconciliation.
    Synchronize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MergeStats {
    pub groups_added: usize,
    pub entries_added: usize,
    pub entries_updated: usize,
    pub entries_relocated: usize,
    pub groups_relocated: usize,
    pub objects_removed: usize,
    pub tombstones_adopted: usize,
    /// False when the run was cancelled before processing every source
    /// entry. The destination is still consistent and the merge can simply
    /// be re-run.
    pub completed: bool,
}

/// Merge `src` into `dst` in place.
pub fn merge_in(
    dst: &mut Database,
    src: &Database,
    method: MergeMethod,
    logger: &dyn StatusLogger,
) -> MergeStats {
    let mut stats = MergeStats::default();

    let relabeled;
    let (src, method) = match method {
        MergeMethod::CreateNewUuids => {
            let mut owned = src.clone();
            relabel(&mut owned);
            relabeled = owned;
            (&relabeled, MergeMethod::KeepExisting)
        }
        other => (src, other),
    };

    let synchronize = method == MergeMethod::Synchronize;
    let total = src.entry_count().max(1);
    let mut processed = 0usize;

    // Groups first so entries always find their parents.
    let mut src_groups = Vec::new();
    collect_groups(&src.root, None, &mut src_groups);
    for (parent, uuid) in &src_groups {
        merge_group(dst, src, *parent, *uuid, synchronize, &mut stats);
    }

    let mut src_entries = Vec::new();
    collect_entries(&src.root, &mut src_entries);
    for (parent, uuid) in &src_entries {
        processed += 1;
        if !logger.set_progress((processed * 100 / total).min(100) as u32) {
            debug!(processed, "merge cancelled");
            return stats;
        }
        merge_entry(dst, src, *parent, *uuid, synchronize, &mut stats);
    }

    if synchronize {
        apply_deletions(dst, src, &mut stats);
        merge_meta(dst, src);
    }
    merge_custom_icons(dst, src);

    stats.completed = true;
    debug!(
        entries_added = stats.entries_added,
        entries_updated = stats.entries_updated,
        objects_removed = stats.objects_removed,
        "merge finished"
    );
    stats
}

fn relabel(db: &mut Database) {
    fn walk(g: &mut Group) {
        g.uuid = Uuid::new_v4();
        for e in &mut g.entries {
            e.uuid = Uuid::new_v4();
            for h in &mut e.history {
                h.uuid = e.uuid;
            }
        }
        for c in &mut g.groups {
            walk(c);
        }
    }
    walk(&mut db.root);
    db.deleted_objects.clear();
}

fn collect_groups(g: &Group, parent: Option<Uuid>, out: &mut Vec<(Option<Uuid>, Uuid)>) {
    out.push((parent, g.uuid));
    for c in &g.groups {
        collect_groups(c, Some(g.uuid), out);
    }
}

fn collect_entries(g: &Group, out: &mut Vec<(Uuid, Uuid)>) {
    for e in &g.entries {
        out.push((g.uuid, e.uuid));
    }
    for c in &g.groups {
        collect_entries(c, out);
    }
}

/// Map a source parent UUID onto its destination counterpart. The source
/// root always maps to the destination root; an unknown parent maps to the
/// root as well.
fn counterpart_parent(dst: &Database, src: &Database, parent: Option<Uuid>) -> Uuid {
    match parent {
        None => dst.root.uuid,
        Some(p) if p == src.root.uuid => dst.root.uuid,
        Some(p) => dst
            .find_group(p)
            .map(|g| g.uuid)
            .unwrap_or(dst.root.uuid),
    }
}

fn merge_group(
    dst: &mut Database,
    src: &Database,
    parent: Option<Uuid>,
    uuid: Uuid,
    synchronize: bool,
    stats: &mut MergeStats,
) {
    let src_group = src.find_group(uuid).expect("collected from src");

    // The two roots pair up regardless of UUID; only their properties sync.
    if parent.is_none() {
        if synchronize && uuid == dst.root.uuid {
            dst.root.assign_properties(src_group, true);
        }
        return;
    }

    if dst.find_group(uuid).is_some() {
        if !synchronize {
            return;
        }
        dst.find_group_mut(uuid)
            .expect("present")
            .assign_properties(src_group, true);

        let desired = counterpart_parent(dst, src, parent);
        let current = dst.parent_of_group(uuid).map(|g| g.uuid);
        if current != Some(desired) {
            let src_loc = src_group.times.location_changed;
            let dst_loc = dst.find_group(uuid).expect("present").times.location_changed;
            if src_loc > dst_loc && dst.relocate_group(uuid, desired) {
                dst.find_group_mut(uuid).expect("present").times.location_changed = src_loc;
                stats.groups_relocated += 1;
            }
        }
        return;
    }

    // Absent: a tombstone means the deletion wins unless the group was
    // modified after it.
    if let Some(t) = dst.tombstone_for(uuid) {
        if src_group.times.last_modification <= t.deletion_time {
            return;
        }
        dst.remove_tombstone(uuid);
    }
    let target = counterpart_parent(dst, src, parent);
    let node = src_group.clone_shallow();
    dst.find_group_mut(target)
        .expect("counterpart exists")
        .groups
        .push(node);
    stats.groups_added += 1;
}

fn merge_entry(
    dst: &mut Database,
    src: &Database,
    parent: Uuid,
    uuid: Uuid,
    synchronize: bool,
    stats: &mut MergeStats,
) {
    let src_entry = src.find_entry(uuid).expect("collected from src");

    if dst.find_entry(uuid).is_none() {
        if let Some(t) = dst.tombstone_for(uuid) {
            if src_entry.times.last_modification <= t.deletion_time {
                return;
            }
            dst.remove_tombstone(uuid);
        }
        let target = counterpart_parent(dst, src, Some(parent));
        dst.add_entry(Some(target), src_entry.clone());
        stats.entries_added += 1;
        return;
    }

    if !synchronize {
        return;
    }

    let dst_entry = dst.find_entry_mut(uuid).expect("present");
    if sync_entry(dst_entry, src_entry) {
        stats.entries_updated += 1;
    }

    let desired = counterpart_parent(dst, src, Some(parent));
    let current = dst.parent_of_entry(uuid).map(|g| g.uuid);
    if current != Some(desired) {
        let src_loc = src_entry.times.location_changed;
        let dst_loc = dst.find_entry(uuid).expect("present").times.location_changed;
        if src_loc > dst_loc && dst.relocate_entry(uuid, desired) {
            dst.find_entry_mut(uuid).expect("present").times.location_changed = src_loc;
            stats.entries_relocated += 1;
        }
    }
}

/// Reconcile one entry present on both sides. Returns whether the
/// destination's live state changed.
fn sync_entry(dst_entry: &mut Entry, src_entry: &Entry) -> bool {
    let cmp = CompareOptions {
        ignore_last_access: true,
        ignore_history: true,
        ..Default::default()
    };

    let mut updated = false;
    if !dst_entry.equals(src_entry, &cmp) {
        use std::cmp::Ordering;
        match src_entry
            .times
            .last_modification
            .cmp(&dst_entry.times.last_modification)
        {
            Ordering::Greater => {
                // Source wins; the losing destination state goes to history
                // unless the source already carries it.
                if !src_entry.has_backup_of_data(dst_entry) {
                    dst_entry.create_backup();
                }
                dst_entry.assign_properties(src_entry, false, false, false);
                updated = true;
            }
            Ordering::Less => {
                // Destination wins; preserve the source state as history.
                if !dst_entry.has_backup_of_data(src_entry) {
                    let mut snapshot = src_entry.clone();
                    snapshot.history.clear();
                    dst_entry.history.push(snapshot);
                    dst_entry
                        .history
                        .sort_by_key(|h| h.times.last_modification);
                }
            }
            // Exact tie: the destination's existing version is kept, which
            // makes the merge idempotent.
            Ordering::Equal => {}
        }
    }
    merge_history(dst_entry, src_entry);
    updated
}

/// Union the history lists snapshot-by-snapshot, keyed by modification
/// time; existing destination snapshots are preferred. Never truncates.
fn merge_history(dst_entry: &mut Entry, src_entry: &Entry) {
    let mut added = false;
    for snapshot in &src_entry.history {
        let seen = dst_entry
            .history
            .iter()
            .any(|h| h.times.last_modification == snapshot.times.last_modification);
        if !seen {
            let mut s = snapshot.clone();
            s.history.clear();
            dst_entry.history.push(s);
            added = true;
        }
    }
    if added {
        dst_entry
            .history
            .sort_by_key(|h| h.times.last_modification);
    }
}

/// Apply the source's tombstones: an object not modified since its deletion
/// time is removed and the tombstone adopted; a later modification wins
/// over the deletion. Unknown UUIDs just adopt the tombstone.
fn apply_deletions(dst: &mut Database, src: &Database, stats: &mut MergeStats) {
    for d in &src.deleted_objects {
        if let Some(entry) = dst.find_entry(d.uuid) {
            if entry.times.last_modification <= d.deletion_time {
                dst.take_entry(d.uuid);
                dst.add_tombstone(d.uuid, d.deletion_time);
                stats.objects_removed += 1;
            }
        } else if dst.find_group(d.uuid).is_none() {
            dst.add_tombstone(d.uuid, d.deletion_time);
            stats.tombstones_adopted += 1;
        }
    }

    // Groups after entries, repeated until a fixpoint so emptied subtrees
    // collapse bottom-up. Only an empty, unmodified group is removed.
    loop {
        let mut removed_any = false;
        for d in &src.deleted_objects {
            if let Some(group) = dst.find_group(d.uuid) {
                if group.uuid != dst.root.uuid
                    && group.times.last_modification <= d.deletion_time
                    && group.entries.is_empty()
                    && group.groups.is_empty()
                {
                    dst.take_group(d.uuid);
                    dst.add_tombstone(d.uuid, d.deletion_time);
                    stats.objects_removed += 1;
                    removed_any = true;
                }
            }
        }
        if !removed_any {
            break;
        }
    }
}

fn merge_meta(dst: &mut Database, src: &Database) {
    if src.meta.recycle_bin_changed > dst.meta.recycle_bin_changed {
        dst.meta.recycle_bin_enabled = src.meta.recycle_bin_enabled;
        dst.meta.recycle_bin_uuid = src.meta.recycle_bin_uuid;
        dst.meta.recycle_bin_changed = src.meta.recycle_bin_changed;
    }
}

fn merge_custom_icons(dst: &mut Database, src: &Database) {
    for icon in &src.meta.custom_icons {
        if dst.meta.custom_icon(icon.uuid).is_none() {
            dst.meta.custom_icons.push(icon.clone());
        }
    }
}
