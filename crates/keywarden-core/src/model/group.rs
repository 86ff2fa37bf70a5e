//! Groups: the tree's interior nodes.
//!
//! A group owns its child groups and entries through its two lists; parent
//! back-references are a relation resolved by the database (`parent_of`),
//! never a second ownership edge.

use uuid::Uuid;

use super::entry::Entry;
use super::times::Times;

pub const DEFAULT_GROUP_ICON: u32 = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub times: Times,
    /// UI hint only; persisted but without engine semantics.
    pub is_expanded: bool,
    pub default_auto_type_sequence: Option<String>,
    /// View-state pointer by UUID — a reference, not ownership.
    pub last_top_visible_entry: Option<Uuid>,
    pub groups: Vec<Group>,
    pub entries: Vec<Entry>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            notes: String::new(),
            icon_id: DEFAULT_GROUP_ICON,
            custom_icon: None,
            times: Times::new(),
            is_expanded: true,
            default_auto_type_sequence: None,
            last_top_visible_entry: None,
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn touch(&mut self, modified: bool) {
        self.times.touch(modified);
    }

    /// Clone the node's own properties without children.
    pub fn clone_shallow(&self) -> Group {
        Group {
            groups: Vec::new(),
            entries: Vec::new(),
            ..self.clone()
        }
    }

    /// Adopt another group's properties (not its children). With
    /// `only_if_newer`, an older template is a no-op.
    pub fn assign_properties(&mut self, template: &Group, only_if_newer: bool) -> bool {
        if only_if_newer && template.times.last_modification <= self.times.last_modification {
            return false;
        }
        self.name = template.name.clone();
        self.notes = template.notes.clone();
        self.icon_id = template.icon_id;
        self.custom_icon = template.custom_icon;
        self.is_expanded = template.is_expanded;
        self.default_auto_type_sequence = template.default_auto_type_sequence.clone();
        self.last_top_visible_entry = template.last_top_visible_entry;
        let location_changed = self.times.location_changed;
        self.times = template.times.clone();
        self.times.location_changed = location_changed;
        true
    }

    /// Entries in this subtree, depth first.
    pub fn entry_count(&self) -> usize {
        self.entries.len() + self.groups.iter().map(Group::entry_count).sum::<usize>()
    }

    /// Groups in this subtree, this node included.
    pub fn group_count(&self) -> usize {
        1 + self.groups.iter().map(Group::group_count).sum::<usize>()
    }

    /// Depth-first visit of every entry in the subtree.
    pub fn for_each_entry<'a>(&'a self, f: &mut dyn FnMut(&'a Entry)) {
        for entry in &self.entries {
            f(entry);
        }
        for group in &self.groups {
            group.for_each_entry(f);
        }
    }

    /// Whether `uuid` names this group or any group below it.
    pub fn contains_group(&self, uuid: Uuid) -> bool {
        self.uuid == uuid || self.groups.iter().any(|g| g.contains_group(uuid))
    }
}
