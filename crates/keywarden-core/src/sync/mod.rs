//! Reconciliation of independently edited replicas, plus the plain-XML
//! import entry point.

pub mod merge;

pub use merge::{merge_in, MergeMethod, MergeStats};

use uuid::Uuid;

use crate::error::Result;
use crate::format::xml;
use crate::model::database::Database;
use crate::status::{check_continue, StatusLogger};

/// Import a plain entry-list document into `dst` under the root, assigning
/// fresh UUIDs (foreign sources cannot supply stable identities). Returns
/// the number of entries imported.
pub fn import_entries(
    dst: &mut Database,
    data: &[u8],
    logger: &dyn StatusLogger,
) -> Result<usize> {
    let entries = xml::read_entry_list(data)?;
    let total = entries.len().max(1);
    let mut imported = 0usize;
    for mut entry in entries {
        check_continue(logger, (imported * 100 / total).min(100) as u32)?;
        entry.uuid = Uuid::new_v4();
        for snapshot in &mut entry.history {
            snapshot.uuid = entry.uuid;
        }
        dst.root.entries.push(entry);
        imported += 1;
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::xml::write_entry_list;
    use crate::model::entry::{Entry, KEY_TITLE};
    use crate::model::protected::ProtectedString;
    use crate::status::NullStatusLogger;

    #[test]
    fn import_assigns_fresh_identities() {
        let mut source = Vec::new();
        let mut e = Entry::new();
        e.fields
            .set(KEY_TITLE, ProtectedString::plain("Imported"));
        let old_uuid = e.uuid;
        write_entry_list(&[e], &mut source).unwrap();

        let mut db = Database::new("Target");
        let count = import_entries(&mut db, &source, &NullStatusLogger).unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.entry_count(), 1);
        assert!(db.find_entry(old_uuid).is_none());
        assert_eq!(db.root.entries[0].title(), "Imported");
    }
}
