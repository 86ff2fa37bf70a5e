//! Database-level metadata persisted in the `Meta` section.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::times;

pub const GENERATOR_NAME: &str = "Keywarden";

pub const DEFAULT_MAINTENANCE_HISTORY_DAYS: u32 = 365;
pub const DEFAULT_HISTORY_MAX_ITEMS: u32 = 10;

/// Which standard fields are memory-protected (and therefore written
/// obfuscated into the container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_user_name: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_user_name: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

impl MemoryProtection {
    pub fn protects(&self, key: &str) -> bool {
        use super::entry::*;
        match key {
            KEY_TITLE => self.protect_title,
            KEY_USER_NAME => self.protect_user_name,
            KEY_PASSWORD => self.protect_password,
            KEY_URL => self.protect_url,
            KEY_NOTES => self.protect_notes,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    pub database_name: String,
    pub database_description: String,
    pub default_user_name: String,
    pub maintenance_history_days: u32,
    pub history_max_items: u32,
    pub memory_protection: MemoryProtection,
    pub custom_icons: Vec<CustomIcon>,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Option<Uuid>,
    pub recycle_bin_changed: DateTime<Utc>,
    /// View-state pointers by UUID; references, not ownership.
    pub last_selected_group: Option<Uuid>,
    pub last_top_visible_group: Option<Uuid>,
}

impl Meta {
    pub fn new(name: &str) -> Self {
        Self {
            generator: GENERATOR_NAME.to_string(),
            database_name: name.to_string(),
            database_description: String::new(),
            default_user_name: String::new(),
            maintenance_history_days: DEFAULT_MAINTENANCE_HISTORY_DAYS,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            memory_protection: MemoryProtection::default(),
            custom_icons: Vec::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: None,
            recycle_bin_changed: times::now(),
            last_selected_group: None,
            last_top_visible_group: None,
        }
    }

    pub fn custom_icon(&self, uuid: Uuid) -> Option<&CustomIcon> {
        self.custom_icons.iter().find(|i| i.uuid == uuid)
    }
}
