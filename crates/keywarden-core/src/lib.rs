//! keywarden-core — encrypted password-database engine
//!
//! # Design principles
//! - No custom crypto; every primitive comes from audited Rust crates.
//! - Secret material is zeroized on drop and obfuscated while resident.
//! - Long-running entry points poll a cancellable progress callback.
//!
//! # Module layout
//! - `model`     — in-memory tree: groups, entries, protected values,
//!                 history snapshots, deletion tombstones
//! - `keys`      — composite key factors and the seeded key transformation
//! - `format`    — the binary+XML container codec (header, hashed blocks,
//!                 cipher registry, XML document)
//! - `sync`      — UUID-based merge/synchronize engine and plain-XML import
//! - `rand_pool` — process-wide CSPRNG with an accumulating entropy pool
//! - `quality`   — advisory password-quality scoring
//! - `status`    — progress reporting / cancellation
//! - `error`     — unified error type

pub mod error;
pub mod format;
pub mod keys;
pub mod model;
pub mod quality;
pub mod rand_pool;
pub mod status;
pub mod sync;

pub use error::{Error, Result};
pub use format::{open, open_file, save, save_file};
pub use keys::CompositeKey;
pub use model::Database;
pub use rand_pool::RandomPool;
pub use status::{NullStatusLogger, StatusLogger};
pub use sync::{import_entries, merge_in, MergeMethod};
