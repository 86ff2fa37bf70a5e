//! User key factors — the credential sources a composite key combines.
//!
//! Closed polymorphism over "produces protected key-material bytes":
//! `Password`, `KeyFile`, `UserAccount` (OS-keyring-bound secret) and
//! `Custom` (a registered provider callback). Raw material is held
//! obfuscated in memory and only revealed during key generation.

use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::model::ProtectedBinary;
use crate::rand_pool::RandomPool;

// ── Password ────────────────────────────────────────────────────────────────

/// Master-password factor. The password itself is hashed immediately; only
/// the digest stays resident (obfuscated).
pub struct PasswordKey {
    material: ProtectedBinary,
}

impl PasswordKey {
    pub fn new(password: &str) -> Self {
        let digest = Sha256::digest(password.as_bytes());
        Self {
            material: ProtectedBinary::protected(&digest),
        }
    }
}

// ── Key file ────────────────────────────────────────────────────────────────

/// Key-file factor. Understands the XML key-file format
/// (`<KeyFile><Key><Data>base64</Data></Key></KeyFile>`), raw 32-byte files,
/// 64-character hex files, and hashes anything else.
#[derive(Debug)]
pub struct FileKey {
    path: PathBuf,
    material: ProtectedBinary,
}

impl FileKey {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)
            .map_err(|e| Error::KeyUnavailable(format!("read key file {}: {e}", path.display())))?;
        let material = Self::extract_material(&data)?;
        Ok(Self {
            path,
            material: ProtectedBinary::protected(&material),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn extract_material(data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.starts_with(b"<?xml") || data.starts_with(b"<KeyFile") {
            if let Some(key) = Self::parse_xml_key_file(data)? {
                return Ok(key);
            }
        }
        if data.len() == 32 {
            return Ok(Zeroizing::new(data.to_vec()));
        }
        if data.len() == 64 && data.iter().all(u8::is_ascii_hexdigit) {
            let decoded = hex::decode(data)
                .map_err(|e| Error::KeyUnavailable(format!("hex key file: {e}")))?;
            return Ok(Zeroizing::new(decoded));
        }
        Ok(Zeroizing::new(Sha256::digest(data).to_vec()))
    }

    /// Pull the base64 key out of an XML key file; `Ok(None)` when the
    /// document is XML but not a key file (it then gets hashed whole).
    fn parse_xml_key_file(data: &[u8]) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::KeyUnavailable(format!("key file encoding: {e}")))?;
        let mut reader = Reader::from_str(text);
        let mut in_key = false;
        let mut in_data = false;
        let mut seen_keyfile = false;
        let mut payload = String::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"KeyFile" => seen_keyfile = true,
                    b"Key" => in_key = true,
                    b"Data" if in_key => in_data = true,
                    _ => {}
                },
                Ok(Event::End(e)) => match e.name().as_ref() {
                    b"Key" => in_key = false,
                    b"Data" => in_data = false,
                    _ => {}
                },
                Ok(Event::Text(t)) if in_data => {
                    payload.push_str(
                        &t.unescape()
                            .map_err(|e| Error::KeyUnavailable(format!("key file XML: {e}")))?,
                    );
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(Error::KeyUnavailable(format!("key file XML: {e}"))),
                _ => {}
            }
        }
        if !seen_keyfile || payload.is_empty() {
            return Ok(None);
        }
        let compact: String = payload.split_whitespace().collect();
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| Error::KeyUnavailable(format!("key file data: {e}")))?;
        Ok(Some(Zeroizing::new(decoded)))
    }
}

// ── OS account ──────────────────────────────────────────────────────────────

const KEYRING_SERVICE: &str = "keywarden";
const KEYRING_USER: &str = "account-key";

/// OS-account-bound factor: a random secret stored in the platform keyring,
/// created on first use. Databases keyed with it only open under the same
/// OS account.
pub struct UserAccountKey {
    material: ProtectedBinary,
}

impl UserAccountKey {
    pub fn load_or_create(pool: &RandomPool) -> Result<Self> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
            .map_err(|e| Error::KeyUnavailable(format!("keyring: {e}")))?;
        let secret = match entry.get_password() {
            Ok(hex_secret) => hex::decode(hex_secret)
                .map_err(|e| Error::KeyUnavailable(format!("stored account key: {e}")))?,
            Err(keyring::Error::NoEntry) => {
                let fresh = pool.bytes(32);
                entry
                    .set_password(&hex::encode(&fresh))
                    .map_err(|e| Error::KeyUnavailable(format!("keyring: {e}")))?;
                fresh
            }
            Err(e) => return Err(Error::KeyUnavailable(format!("keyring: {e}"))),
        };
        Ok(Self {
            material: ProtectedBinary::protected(&secret),
        })
    }

    /// Build from raw bytes, bypassing the keyring. For contexts that manage
    /// the account secret themselves.
    pub fn from_raw(secret: &[u8]) -> Self {
        Self {
            material: ProtectedBinary::protected(secret),
        }
    }
}

// ── Custom providers ────────────────────────────────────────────────────────

/// Context handed to a key provider when its material is requested.
#[derive(Debug, Clone, Default)]
pub struct KeyProviderContext {
    pub database_path: Option<PathBuf>,
    pub creating_new_key: bool,
}

/// Externally supplied key source, registered by name.
pub trait KeyProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Exclusive providers refuse combination with any other factor.
    fn exclusive(&self) -> bool {
        false
    }

    /// Direct-key providers return the raw 32-byte composite key; their
    /// output bypasses the concatenate-and-hash step. Implies exclusivity.
    fn direct_key(&self) -> bool {
        false
    }

    fn key_data(&self, ctx: &KeyProviderContext) -> Result<Vec<u8>>;
}

/// Name-keyed provider registry.
#[derive(Default)]
pub struct KeyProviderRegistry {
    providers: HashMap<String, Arc<dyn KeyProvider>>,
}

impl KeyProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn KeyProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.providers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyProvider>> {
        self.providers.get(name).cloned()
    }
}

/// Factor wrapping a provider invocation. Material is fetched once at
/// construction; a failing provider surfaces before any key is assembled.
#[derive(Debug)]
pub struct CustomKey {
    name: String,
    exclusive: bool,
    direct: bool,
    material: ProtectedBinary,
}

impl CustomKey {
    pub fn from_provider(
        provider: &dyn KeyProvider,
        ctx: &KeyProviderContext,
    ) -> Result<Self> {
        let data = Zeroizing::new(provider.key_data(ctx)?);
        if data.is_empty() {
            return Err(Error::KeyUnavailable(format!(
                "provider {} returned no key material",
                provider.name()
            )));
        }
        if provider.direct_key() && data.len() != 32 {
            return Err(Error::KeyUnavailable(format!(
                "direct-key provider {} must return 32 bytes, got {}",
                provider.name(),
                data.len()
            )));
        }
        Ok(Self {
            name: provider.name().to_string(),
            exclusive: provider.exclusive() || provider.direct_key(),
            direct: provider.direct_key(),
            material: ProtectedBinary::protected(&data),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ── The closed factor set ───────────────────────────────────────────────────

pub enum UserKey {
    Password(PasswordKey),
    KeyFile(FileKey),
    UserAccount(UserAccountKey),
    Custom(CustomKey),
}

impl UserKey {
    /// Raw key material, revealed transiently.
    pub fn key_data(&self) -> Zeroizing<Vec<u8>> {
        let material = match self {
            UserKey::Password(k) => &k.material,
            UserKey::KeyFile(k) => &k.material,
            UserKey::UserAccount(k) => &k.material,
            UserKey::Custom(k) => &k.material,
        };
        material.reveal()
    }

    pub fn is_user_account(&self) -> bool {
        matches!(self, UserKey::UserAccount(_))
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, UserKey::Custom(k) if k.exclusive)
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, UserKey::Custom(k) if k.direct)
    }
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKey::Password(_) => write!(f, "UserKey::Password"),
            UserKey::KeyFile(k) => write!(f, "UserKey::KeyFile({})", k.path.display()),
            UserKey::UserAccount(_) => write!(f, "UserKey::UserAccount"),
            UserKey::Custom(k) => write!(f, "UserKey::Custom({})", k.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn password_key_is_digest_of_password() {
        let key = PasswordKey::new("p");
        let expected = Sha256::digest(b"p");
        assert_eq!(&*key.material.reveal(), expected.as_slice());
    }

    #[test]
    fn key_file_raw_32_used_verbatim() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0xabu8; 32]).unwrap();
        let key = FileKey::open(f.path()).unwrap();
        assert_eq!(&*key.material.reveal(), &[0xabu8; 32]);
    }

    #[test]
    fn key_file_hex_64_is_decoded() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(hex::encode([0x5au8; 32]).as_bytes()).unwrap();
        let key = FileKey::open(f.path()).unwrap();
        assert_eq!(&*key.material.reveal(), &[0x5au8; 32]);
    }

    #[test]
    fn key_file_xml_format_is_parsed() {
        use base64::Engine as _;
        let payload = [0x11u8; 32];
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<KeyFile><Meta><Version>1.00</Version></Meta>\
             <Key><Data>{}</Data></Key></KeyFile>",
            base64::engine::general_purpose::STANDARD.encode(payload)
        );
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(xml.as_bytes()).unwrap();
        let key = FileKey::open(f.path()).unwrap();
        assert_eq!(&*key.material.reveal(), payload.as_slice());
    }

    #[test]
    fn key_file_arbitrary_content_is_hashed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"not a structured key file at all").unwrap();
        let key = FileKey::open(f.path()).unwrap();
        let expected = Sha256::digest(b"not a structured key file at all");
        assert_eq!(&*key.material.reveal(), expected.as_slice());
    }

    #[test]
    fn missing_key_file_surfaces_as_key_unavailable() {
        let err = FileKey::open("/nonexistent/keywarden.keyx").unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
    }

    struct FixedProvider {
        direct: bool,
        bytes: Vec<u8>,
    }

    impl KeyProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }
        fn direct_key(&self) -> bool {
            self.direct
        }
        fn key_data(&self, _ctx: &KeyProviderContext) -> Result<Vec<u8>> {
            Ok(self.bytes.clone())
        }
    }

    #[test]
    fn direct_provider_must_return_32_bytes() {
        let provider = FixedProvider {
            direct: true,
            bytes: vec![1, 2, 3],
        };
        let err =
            CustomKey::from_provider(&provider, &KeyProviderContext::default()).unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
    }

    #[test]
    fn registry_round_trip() {
        let mut registry = KeyProviderRegistry::new();
        registry.register(Arc::new(FixedProvider {
            direct: false,
            bytes: vec![9; 16],
        }));
        assert!(registry.get("fixed").is_some());
        assert!(registry.unregister("fixed"));
        assert!(registry.get("fixed").is_none());
    }
}
