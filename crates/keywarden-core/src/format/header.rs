//! Cleartext container header.
//!
//! Layout: two fixed signature words, a version word, then TLV fields
//! (1-byte field id, 2-byte LE length, payload) terminated by the
//! end-of-header marker whose payload is `\r\n\r\n`.

use std::io::{Read, Write};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::database::{CompressionAlgorithm, Settings};
use crate::rand_pool::RandomPool;

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const SIGNATURE_2: u32 = 0xB54B_FB67;

pub const FILE_VERSION: u32 = 0x0004_0000;
/// Only the major half participates in the compatibility check; minor
/// revisions stay readable.
pub const FILE_VERSION_CRITICAL_MASK: u32 = 0xFFFF_0000;

pub const END_OF_HEADER_MARKER: &[u8] = b"\r\n\r\n";

mod field {
    pub const END_OF_HEADER: u8 = 0;
    pub const COMMENT: u8 = 1;
    pub const CIPHER_ID: u8 = 2;
    pub const COMPRESSION_FLAGS: u8 = 3;
    pub const MASTER_SEED: u8 = 4;
    pub const TRANSFORM_SEED: u8 = 5;
    pub const TRANSFORM_ROUNDS: u8 = 6;
    pub const ENCRYPTION_IV: u8 = 7;
    pub const PROTECTED_STREAM_KEY: u8 = 8;
    pub const STREAM_START_BYTES: u8 = 9;
}

#[derive(Debug, Clone)]
pub struct Header {
    pub cipher_uuid: Uuid,
    pub compression: CompressionAlgorithm,
    pub master_seed: [u8; 32],
    pub transform_seed: [u8; 32],
    pub transform_rounds: u64,
    pub encryption_iv: Vec<u8>,
    pub protected_stream_key: [u8; 32],
    pub stream_start_bytes: [u8; 32],
}

impl Header {
    /// Fresh header for a save: all random material drawn from the pool.
    pub fn generate(settings: &Settings, iv_length: usize, pool: &RandomPool) -> Self {
        Self {
            cipher_uuid: settings.cipher_uuid,
            compression: settings.compression,
            master_seed: pool.array(),
            transform_seed: pool.array(),
            transform_rounds: settings.transform_rounds,
            encryption_iv: pool.bytes(iv_length),
            protected_stream_key: pool.array(),
            stream_start_bytes: pool.array(),
        }
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&SIGNATURE_1.to_le_bytes())?;
        w.write_all(&SIGNATURE_2.to_le_bytes())?;
        w.write_all(&FILE_VERSION.to_le_bytes())?;

        write_field(w, field::CIPHER_ID, self.cipher_uuid.as_bytes())?;
        write_field(
            w,
            field::COMPRESSION_FLAGS,
            &self.compression.id().to_le_bytes(),
        )?;
        write_field(w, field::MASTER_SEED, &self.master_seed)?;
        write_field(w, field::TRANSFORM_SEED, &self.transform_seed)?;
        write_field(
            w,
            field::TRANSFORM_ROUNDS,
            &self.transform_rounds.to_le_bytes(),
        )?;
        write_field(w, field::ENCRYPTION_IV, &self.encryption_iv)?;
        write_field(w, field::PROTECTED_STREAM_KEY, &self.protected_stream_key)?;
        write_field(w, field::STREAM_START_BYTES, &self.stream_start_bytes)?;
        write_field(w, field::END_OF_HEADER, END_OF_HEADER_MARKER)?;
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let sig1 = read_u32(r)?;
        let sig2 = read_u32(r)?;
        if sig1 != SIGNATURE_1 || sig2 != SIGNATURE_2 {
            return Err(Error::InvalidSignature);
        }
        let version = read_u32(r)?;
        if version & FILE_VERSION_CRITICAL_MASK > FILE_VERSION & FILE_VERSION_CRITICAL_MASK {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut cipher_uuid = None;
        let mut compression = None;
        let mut master_seed = None;
        let mut transform_seed = None;
        let mut transform_rounds = None;
        let mut encryption_iv = None;
        let mut protected_stream_key = None;
        let mut stream_start_bytes = None;

        loop {
            let mut id = [0u8; 1];
            read_exact_or_truncated(r, &mut id)?;
            let mut len_bytes = [0u8; 2];
            read_exact_or_truncated(r, &mut len_bytes)?;
            let len = u16::from_le_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len];
            read_exact_or_truncated(r, &mut payload)?;

            match id[0] {
                field::END_OF_HEADER => {
                    if payload != END_OF_HEADER_MARKER {
                        return Err(Error::TruncatedHeader);
                    }
                    break;
                }
                field::COMMENT => {}
                field::CIPHER_ID => {
                    cipher_uuid = Some(Uuid::from_bytes(
                        payload.try_into().map_err(|_| Error::TruncatedHeader)?,
                    ));
                }
                field::COMPRESSION_FLAGS => {
                    let id = u32::from_le_bytes(
                        payload.try_into().map_err(|_| Error::TruncatedHeader)?,
                    );
                    compression = Some(
                        CompressionAlgorithm::from_id(id)
                            .ok_or(Error::UnknownCompression(id))?,
                    );
                }
                field::MASTER_SEED => {
                    master_seed =
                        Some(payload.try_into().map_err(|_| Error::TruncatedHeader)?);
                }
                field::TRANSFORM_SEED => {
                    transform_seed =
                        Some(payload.try_into().map_err(|_| Error::TruncatedHeader)?);
                }
                field::TRANSFORM_ROUNDS => {
                    transform_rounds = Some(u64::from_le_bytes(
                        payload.try_into().map_err(|_| Error::TruncatedHeader)?,
                    ));
                }
                field::ENCRYPTION_IV => encryption_iv = Some(payload),
                field::PROTECTED_STREAM_KEY => {
                    protected_stream_key =
                        Some(payload.try_into().map_err(|_| Error::TruncatedHeader)?);
                }
                field::STREAM_START_BYTES => {
                    stream_start_bytes =
                        Some(payload.try_into().map_err(|_| Error::TruncatedHeader)?);
                }
                unknown => {
                    warn!(field = unknown, len, "skipping unknown header field");
                }
            }
        }

        Ok(Self {
            cipher_uuid: cipher_uuid.ok_or(Error::MissingHeaderField("cipher id"))?,
            compression: compression.ok_or(Error::MissingHeaderField("compression flags"))?,
            master_seed: master_seed.ok_or(Error::MissingHeaderField("master seed"))?,
            transform_seed: transform_seed.ok_or(Error::MissingHeaderField("transform seed"))?,
            transform_rounds: transform_rounds
                .ok_or(Error::MissingHeaderField("transform rounds"))?,
            encryption_iv: encryption_iv.ok_or(Error::MissingHeaderField("encryption iv"))?,
            protected_stream_key: protected_stream_key
                .ok_or(Error::MissingHeaderField("protected stream key"))?,
            stream_start_bytes: stream_start_bytes
                .ok_or(Error::MissingHeaderField("stream start bytes"))?,
        })
    }
}

fn write_field(w: &mut impl Write, id: u8, payload: &[u8]) -> Result<()> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    w.write_all(&[id])?;
    w.write_all(&(payload.len() as u16).to_le_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_truncated(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact_or_truncated(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedHeader
        } else {
            Error::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header::generate(&Settings::default(), 16, &RandomPool::new())
    }

    #[test]
    fn round_trip() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();

        let parsed = Header::read(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed.cipher_uuid, header.cipher_uuid);
        assert_eq!(parsed.compression, header.compression);
        assert_eq!(parsed.master_seed, header.master_seed);
        assert_eq!(parsed.transform_seed, header.transform_seed);
        assert_eq!(parsed.transform_rounds, header.transform_rounds);
        assert_eq!(parsed.encryption_iv, header.encryption_iv);
        assert_eq!(parsed.protected_stream_key, header.protected_stream_key);
        assert_eq!(parsed.stream_start_bytes, header.stream_start_bytes);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut buf = Vec::new();
        sample_header().write(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        assert!(matches!(
            Header::read(&mut buf.as_slice()),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let mut buf = Vec::new();
        sample_header().write(&mut buf).unwrap();
        let future = (FILE_VERSION + 0x0001_0000).to_le_bytes();
        buf[8..12].copy_from_slice(&future);
        assert!(matches!(
            Header::read(&mut buf.as_slice()),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let mut buf = Vec::new();
        sample_header().write(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(matches!(
            Header::read(&mut buf.as_slice()),
            Err(Error::TruncatedHeader)
        ));
    }

    #[test]
    fn unknown_compression_id_is_rejected() {
        let mut buf = Vec::new();
        sample_header().write(&mut buf).unwrap();
        // Compression payload sits right after the 16-byte cipher uuid field.
        let pos = 12 + (3 + 16) + 3;
        buf[pos] = 0x7F;
        assert!(matches!(
            Header::read(&mut buf.as_slice()),
            Err(Error::UnknownCompression(0x7F))
        ));
    }

    #[test]
    fn unknown_field_ids_are_skipped() {
        let header = sample_header();
        let mut buf = Vec::new();
        w_partial(&header, &mut buf);
        let parsed = Header::read(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed.master_seed, header.master_seed);
    }

    fn w_partial(header: &Header, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        buf.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        // An unrecognized vendor field before the normal ones.
        write_field(buf, 0x70, b"vendor-extension").unwrap();
        write_field(buf, field::CIPHER_ID, header.cipher_uuid.as_bytes()).unwrap();
        write_field(
            buf,
            field::COMPRESSION_FLAGS,
            &header.compression.id().to_le_bytes(),
        )
        .unwrap();
        write_field(buf, field::MASTER_SEED, &header.master_seed).unwrap();
        write_field(buf, field::TRANSFORM_SEED, &header.transform_seed).unwrap();
        write_field(
            buf,
            field::TRANSFORM_ROUNDS,
            &header.transform_rounds.to_le_bytes(),
        )
        .unwrap();
        write_field(buf, field::ENCRYPTION_IV, &header.encryption_iv).unwrap();
        write_field(buf, field::PROTECTED_STREAM_KEY, &header.protected_stream_key).unwrap();
        write_field(buf, field::STREAM_START_BYTES, &header.stream_start_bytes).unwrap();
        write_field(buf, field::END_OF_HEADER, END_OF_HEADER_MARKER).unwrap();
    }
}
