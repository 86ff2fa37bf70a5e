//! Composite key derivation: credential factors, the seeded block-cipher
//! key transformation, and its auto-calibration benchmark.

pub mod composite;
pub mod factor;
pub mod transform;

pub use composite::CompositeKey;
pub use factor::{
    CustomKey, FileKey, KeyProvider, KeyProviderContext, KeyProviderRegistry, PasswordKey,
    UserAccountKey, UserKey,
};
pub use transform::{transform_key, transform_key_benchmark};
