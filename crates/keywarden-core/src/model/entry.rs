//! Password entries: field map, attachments, auto-type, version history.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::protected::{ProtectedBinary, ProtectedString};
use super::times::Times;

pub const KEY_TITLE: &str = "Title";
pub const KEY_USER_NAME: &str = "UserName";
pub const KEY_PASSWORD: &str = "Password";
pub const KEY_URL: &str = "URL";
pub const KEY_NOTES: &str = "Notes";

pub const STANDARD_KEYS: [&str; 5] = [KEY_TITLE, KEY_USER_NAME, KEY_PASSWORD, KEY_URL, KEY_NOTES];

pub fn is_standard_key(key: &str) -> bool {
    STANDARD_KEYS.contains(&key)
}

/// Field-name → protected-string map. Keys are unique; insertion order is
/// preserved because custom fields display in the order the user added them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldMap {
    fields: Vec<(String, ProtectedString)>,
}

impl FieldMap {
    pub fn get(&self, key: &str) -> Option<&ProtectedString> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, value: ProtectedString) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ProtectedString> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProtectedString)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One window-title → keystroke-sequence override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub sequence: Option<String>,
}

/// Auto-type configuration carried by an entry. The engine only stores it;
/// keystroke injection happens in external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: u32,
    pub default_sequence: Option<String>,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: None,
            associations: Vec::new(),
        }
    }
}

/// Exclusion flags for [`Entry::equals`]. Defaults compare everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    pub ignore_last_modification: bool,
    pub ignore_last_access: bool,
    pub ignore_history: bool,
    /// Skip the other entry's most recent history snapshot, for comparing a
    /// live entry against a version that already backed it up.
    pub ignore_last_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub uuid: Uuid,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub foreground_color: Option<String>,
    pub background_color: Option<String>,
    pub override_url: String,
    pub tags: Vec<String>,
    pub times: Times,
    pub fields: FieldMap,
    pub binaries: Vec<(String, ProtectedBinary)>,
    pub auto_type: AutoType,
    /// Snapshots of earlier states, oldest first. Snapshots never carry their
    /// own history — depth is exactly one.
    pub history: Vec<Entry>,
}

pub const DEFAULT_ENTRY_ICON: u32 = 0;

impl Entry {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            icon_id: DEFAULT_ENTRY_ICON,
            custom_icon: None,
            foreground_color: None,
            background_color: None,
            override_url: String::new(),
            tags: Vec::new(),
            times: Times::new(),
            fields: FieldMap::default(),
            binaries: Vec::new(),
            auto_type: AutoType::default(),
            history: Vec::new(),
        }
    }

    pub fn title(&self) -> String {
        self.fields
            .get(KEY_TITLE)
            .map(|v| v.read().to_string())
            .unwrap_or_default()
    }

    pub fn binary(&self, name: &str) -> Option<&ProtectedBinary> {
        self.binaries.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn set_binary(&mut self, name: &str, value: ProtectedBinary) {
        match self.binaries.iter_mut().find(|(n, _)| n == name) {
            Some((_, b)) => *b = value,
            None => self.binaries.push((name.to_string(), value)),
        }
    }

    pub fn touch(&mut self, modified: bool) {
        self.times.touch(modified);
    }

    /// Deep-clone the current state (without history) and append it to the
    /// history list. Call before overwriting fields on the standard edit
    /// path so no edit is ever silently discarded.
    pub fn create_backup(&mut self) {
        let mut snapshot = self.clone();
        snapshot.history.clear();
        self.history.push(snapshot);
    }

    /// Trim the oldest snapshots down to `max_items`. Merge never calls
    /// this; it is a maintenance policy applied on the edit path.
    pub fn maintain_backups(&mut self, max_items: usize) {
        if self.history.len() > max_items {
            let excess = self.history.len() - max_items;
            self.history.drain(..excess);
        }
    }

    /// Back up the current state, then adopt the chosen snapshot's data.
    ///
    /// Panics if `index` is out of range — that is a caller bug, not a
    /// runtime condition.
    pub fn restore_from_backup(&mut self, index: usize) {
        assert!(
            index < self.history.len(),
            "history index {index} out of range ({} snapshots)",
            self.history.len()
        );
        self.create_backup();
        let snapshot = self.history[index].clone();
        self.assign_properties(&snapshot, false, false, false);
    }

    /// Adopt another entry's field values. With `only_if_newer`, a template
    /// whose modification time does not exceed ours is a no-op; returns
    /// whether anything was assigned.
    pub fn assign_properties(
        &mut self,
        template: &Entry,
        only_if_newer: bool,
        include_history: bool,
        assign_location_changed: bool,
    ) -> bool {
        if only_if_newer && template.times.last_modification <= self.times.last_modification {
            return false;
        }

        self.icon_id = template.icon_id;
        self.custom_icon = template.custom_icon;
        self.foreground_color = template.foreground_color.clone();
        self.background_color = template.background_color.clone();
        self.override_url = template.override_url.clone();
        self.tags = template.tags.clone();
        self.fields = template.fields.clone();
        self.binaries = template.binaries.clone();
        self.auto_type = template.auto_type.clone();

        let location_changed = self.times.location_changed;
        self.times = template.times.clone();
        if !assign_location_changed {
            self.times.location_changed = location_changed;
        }

        if include_history {
            self.history = template.history.clone();
            for snapshot in &mut self.history {
                snapshot.history.clear();
            }
        }
        true
    }

    /// Deep structural comparison with tunable exclusions; the merge engine
    /// uses it to decide whether two replicas of the same entry diverged.
    pub fn equals(&self, other: &Entry, opts: &CompareOptions) -> bool {
        if self.uuid != other.uuid
            || self.icon_id != other.icon_id
            || self.custom_icon != other.custom_icon
            || self.foreground_color != other.foreground_color
            || self.background_color != other.background_color
            || self.override_url != other.override_url
            || self.tags != other.tags
            || self.fields != other.fields
            || self.binaries != other.binaries
            || self.auto_type != other.auto_type
        {
            return false;
        }

        if !self.times_equal(other, opts) {
            return false;
        }

        if !opts.ignore_history {
            let other_history: &[Entry] = if opts.ignore_last_backup && !other.history.is_empty() {
                &other.history[..other.history.len() - 1]
            } else {
                &other.history
            };
            if self.history.len() != other_history.len() {
                return false;
            }
            let inner = CompareOptions {
                ignore_history: true,
                ..*opts
            };
            for (a, b) in self.history.iter().zip(other_history) {
                if !a.equals(b, &inner) {
                    return false;
                }
            }
        }
        true
    }

    fn times_equal(&self, other: &Entry, opts: &CompareOptions) -> bool {
        let a = &self.times;
        let b = &other.times;
        if a.creation != b.creation || a.expires != b.expires || a.expiry != b.expiry {
            return false;
        }
        if !opts.ignore_last_modification && a.last_modification != b.last_modification {
            return false;
        }
        if !opts.ignore_last_access
            && (a.last_access != b.last_access || a.usage_count != b.usage_count)
        {
            return false;
        }
        true
    }

    /// Whether `data`'s state is already recorded among our history
    /// snapshots. Used by the merge engine so a losing version is never
    /// backed up twice.
    pub fn has_backup_of_data(&self, data: &Entry) -> bool {
        let opts = CompareOptions {
            ignore_last_access: true,
            ignore_history: true,
            ..Default::default()
        };
        self.history.iter().any(|h| h.equals(data, &opts))
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.times.is_expired(at)
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_entry() -> Entry {
        let mut e = Entry::new();
        e.fields.set(KEY_TITLE, ProtectedString::plain("Sample"));
        e.fields
            .set(KEY_PASSWORD, ProtectedString::protected("hunter2"));
        e.fields.set("Server Room Code", ProtectedString::plain("4471"));
        e
    }

    #[test]
    fn field_map_preserves_insertion_order() {
        let e = sample_entry();
        let keys: Vec<&str> = e.fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![KEY_TITLE, KEY_PASSWORD, "Server Room Code"]);
    }

    #[test]
    fn backup_snapshots_have_no_nested_history() {
        let mut e = sample_entry();
        e.create_backup();
        e.fields.set(KEY_PASSWORD, ProtectedString::protected("new"));
        e.create_backup();
        assert_eq!(e.history.len(), 2);
        assert!(e.history.iter().all(|h| h.history.is_empty()));
    }

    #[test]
    fn restore_from_backup_round_trips_state() {
        let mut e = sample_entry();
        e.create_backup();
        e.fields
            .set(KEY_PASSWORD, ProtectedString::protected("changed"));
        e.times.touch(true);

        e.restore_from_backup(0);
        assert_eq!(*e.fields.get(KEY_PASSWORD).unwrap().read(), "hunter2");
        // The pre-restore state was itself backed up first.
        assert_eq!(e.history.len(), 2);
        assert_eq!(
            *e.history[1].fields.get(KEY_PASSWORD).unwrap().read(),
            "changed"
        );
    }

    #[test]
    #[should_panic(expected = "history index")]
    fn restore_out_of_range_panics() {
        let mut e = sample_entry();
        e.restore_from_backup(3);
    }

    #[test]
    fn assign_properties_only_if_newer_is_a_noop_for_older_template() {
        let mut live = sample_entry();
        let mut template = live.clone();
        template
            .fields
            .set(KEY_TITLE, ProtectedString::plain("Stale"));
        template.times.last_modification =
            live.times.last_modification - Duration::seconds(30);

        assert!(!live.assign_properties(&template, true, false, false));
        assert_eq!(*live.fields.get(KEY_TITLE).unwrap().read(), "Sample");

        template.times.last_modification =
            live.times.last_modification + Duration::seconds(30);
        assert!(live.assign_properties(&template, true, false, false));
        assert_eq!(*live.fields.get(KEY_TITLE).unwrap().read(), "Stale");
    }

    #[test]
    fn equals_respects_exclusions() {
        let a = sample_entry();
        let mut b = a.clone();
        b.times.last_access = b.times.last_access + Duration::seconds(5);

        assert!(!a.equals(&b, &CompareOptions::default()));
        assert!(a.equals(
            &b,
            &CompareOptions {
                ignore_last_access: true,
                ..Default::default()
            }
        ));
    }

    #[test]
    fn has_backup_of_data_finds_snapshot() {
        let mut e = sample_entry();
        let original = e.clone();
        e.create_backup();
        e.fields
            .set(KEY_PASSWORD, ProtectedString::protected("rotated"));
        e.times.last_modification = e.times.last_modification + Duration::seconds(10);

        assert!(e.has_backup_of_data(&original));
        assert!(!e.has_backup_of_data(&e.clone()));
    }

    #[test]
    fn maintain_backups_drops_oldest() {
        let mut e = sample_entry();
        for i in 0..5 {
            e.fields
                .set(KEY_NOTES, ProtectedString::plain(&format!("rev {i}")));
            e.create_backup();
        }
        e.maintain_backups(2);
        assert_eq!(e.history.len(), 2);
        assert_eq!(*e.history[0].fields.get(KEY_NOTES).unwrap().read(), "rev 3");
    }
}
