//! In-memory tree data model: groups, entries, protected values, history,
//! deletion tombstones.

pub mod database;
pub mod entry;
pub mod group;
pub mod meta;
pub mod protected;
pub mod times;

pub use database::{
    CompressionAlgorithm, Database, DatabaseStats, DeletedObject, Settings,
};
pub use entry::{AutoType, AutoTypeAssociation, CompareOptions, Entry, FieldMap};
pub use group::Group;
pub use meta::{CustomIcon, MemoryProtection, Meta};
pub use protected::{ProtectedBinary, ProtectedString};
pub use times::Times;
