//! Container codec.
//!
//! On-disk layout: cleartext TLV header, then the encrypted body — the
//! stream-start verifier bytes (fast wrong-key detection), a hashed-block
//! stream carrying the optionally gzip-compressed XML document.
//!
//! Body key: SHA-256(master seed ‖ composite key transformed with the
//! header's seed and round count).

pub mod block;
pub mod cipher;
pub mod header;
pub mod xml;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::keys::CompositeKey;
use crate::model::database::{CompressionAlgorithm, Database, Settings};
use crate::rand_pool::RandomPool;
use crate::status::StatusLogger;

pub use cipher::{AesCbcCipher, CipherRegistry, ContentCipher, AES_CIPHER_UUID};
pub use header::Header;
pub use xml::XmlOptions;

fn body_key(
    master_seed: &[u8; 32],
    key: &CompositeKey,
    transform_seed: &[u8; 32],
    rounds: u64,
) -> Result<Zeroizing<[u8; 32]>> {
    let transformed = key.generate_key32(transform_seed, rounds)?;
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(&*transformed);
    let digest = hasher.finalize();
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&digest);
    Ok(out)
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Serialize `db` into `w`, encrypting under `key`.
pub fn save(
    db: &Database,
    key: &CompositeKey,
    pool: &RandomPool,
    logger: &dyn StatusLogger,
    w: &mut impl Write,
) -> Result<()> {
    save_with_registry(
        db,
        key,
        pool,
        &CipherRegistry::default(),
        XmlOptions::default(),
        logger,
        w,
    )
}

pub fn save_with_registry(
    db: &Database,
    key: &CompositeKey,
    pool: &RandomPool,
    registry: &CipherRegistry,
    opts: XmlOptions,
    logger: &dyn StatusLogger,
    w: &mut impl Write,
) -> Result<()> {
    let content_cipher = registry.get(db.settings.cipher_uuid)?;
    let header = Header::generate(&db.settings, content_cipher.iv_length(), pool);
    header.write(w)?;

    let mut document = Vec::new();
    xml::write_document(
        db,
        Some(&header.protected_stream_key),
        opts,
        logger,
        &mut document,
    )?;

    let mut payload = match header.compression {
        CompressionAlgorithm::Gzip => {
            let compressed = compress(&document)?;
            document.zeroize();
            compressed
        }
        CompressionAlgorithm::None => document,
    };

    let mut body = Vec::with_capacity(32 + payload.len() + 128);
    body.extend_from_slice(&header.stream_start_bytes);
    body.extend_from_slice(&block::write_blocks(&payload, block::DEFAULT_BLOCK_SIZE));
    payload.zeroize();

    let key32 = body_key(
        &header.master_seed,
        key,
        &header.transform_seed,
        header.transform_rounds,
    )?;
    let encrypted = content_cipher.encrypt(&key32, &header.encryption_iv, &body)?;
    body.zeroize();
    w.write_all(&encrypted)?;

    info!(
        entries = db.entry_count(),
        groups = db.group_count(),
        cipher = content_cipher.name(),
        "database serialized"
    );
    Ok(())
}

/// Parse and decrypt a database from `r` using `key`.
///
/// A wrong or incomplete composite key surfaces as
/// [`Error::InvalidCompositeKey`] before any tree is returned.
pub fn open(
    r: &mut impl Read,
    key: &CompositeKey,
    logger: &dyn StatusLogger,
) -> Result<Database> {
    open_with_registry(r, key, &CipherRegistry::default(), logger)
}

pub fn open_with_registry(
    r: &mut impl Read,
    key: &CompositeKey,
    registry: &CipherRegistry,
    logger: &dyn StatusLogger,
) -> Result<Database> {
    let header = Header::read(r)?;
    let content_cipher = registry.get(header.cipher_uuid)?;
    debug!(
        cipher = content_cipher.name(),
        rounds = header.transform_rounds,
        "header parsed"
    );

    let mut encrypted = Vec::new();
    r.read_to_end(&mut encrypted)?;

    let key32 = body_key(
        &header.master_seed,
        key,
        &header.transform_seed,
        header.transform_rounds,
    )?;
    let mut body = content_cipher.decrypt(&key32, &header.encryption_iv, &encrypted)?;

    if body.len() < 32 || body[..32] != header.stream_start_bytes {
        body.zeroize();
        return Err(Error::InvalidCompositeKey);
    }

    let mut content = block::read_blocks(&body[32..])?;
    body.zeroize();
    let document = match header.compression {
        CompressionAlgorithm::Gzip => {
            let decompressed = decompress(&content)?;
            content.zeroize();
            decompressed
        }
        CompressionAlgorithm::None => content,
    };

    let mut db = xml::read_document(&document, Some(&header.protected_stream_key), logger)?;
    db.settings = Settings {
        cipher_uuid: header.cipher_uuid,
        compression: header.compression,
        transform_rounds: header.transform_rounds,
    };
    info!(
        entries = db.entry_count(),
        groups = db.group_count(),
        "database loaded"
    );
    Ok(db)
}

/// Convenience path entry point for [`save`].
pub fn save_file(
    db: &Database,
    key: &CompositeKey,
    pool: &RandomPool,
    path: impl AsRef<Path>,
    logger: &dyn StatusLogger,
) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    save(db, key, pool, logger, &mut w)?;
    w.flush()?;
    Ok(())
}

/// Convenience path entry point for [`open`].
pub fn open_file(
    path: impl AsRef<Path>,
    key: &CompositeKey,
    logger: &dyn StatusLogger,
) -> Result<Database> {
    let mut r = BufReader::new(File::open(path)?);
    open(&mut r, key, logger)
}
