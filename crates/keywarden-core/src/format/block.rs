//! Hashed-block framing for the encrypted body.
//!
//! The body is chunked into fixed-size blocks, each carrying its index, a
//! SHA-256 content hash and a length prefix, so corruption is detected
//! block-by-block on read instead of only at end of stream.
//!
//! Block layout: `[u32 LE index][32-byte SHA-256][u32 LE length][payload]`;
//! the stream terminates with a zero-length block whose hash field is zero.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Frame `data` into hashed blocks.
pub fn write_blocks(data: &[u8], block_size: usize) -> Vec<u8> {
    let block_size = block_size.max(1);
    let mut out = Vec::with_capacity(data.len() + 44 * (data.len() / block_size + 2));
    let mut index: u32 = 0;
    for chunk in data.chunks(block_size) {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&Sha256::digest(chunk));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    // Terminator.
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Undo the framing, verifying every block hash.
pub fn read_blocks(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0usize;
    let mut expected_index: u32 = 0;
    loop {
        if pos + 40 > data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated block stream",
            )));
        }
        let index = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        let hash: [u8; 32] = data[pos + 4..pos + 36].try_into().unwrap();
        let len = u32::from_le_bytes(data[pos + 36..pos + 40].try_into().unwrap()) as usize;
        pos += 40;

        if index != expected_index {
            return Err(Error::BlockHashMismatch { index });
        }
        if len == 0 {
            if hash != [0u8; 32] {
                return Err(Error::BlockHashMismatch { index });
            }
            return Ok(out);
        }
        if pos + len > data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated block payload",
            )));
        }
        let payload = &data[pos..pos + len];
        pos += len;
        if Sha256::digest(payload).as_slice() != hash {
            return Err(Error::BlockHashMismatch { index });
        }
        out.extend_from_slice(payload);
        expected_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_small() {
        let data = b"hello hashed blocks";
        let framed = write_blocks(data, DEFAULT_BLOCK_SIZE);
        assert_eq!(read_blocks(&framed).unwrap(), data);
    }

    #[test]
    fn round_trip_multi_block() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let framed = write_blocks(&data, 1024);
        assert_eq!(read_blocks(&framed).unwrap(), data);
    }

    #[test]
    fn empty_payload_is_just_a_terminator() {
        let framed = write_blocks(&[], DEFAULT_BLOCK_SIZE);
        assert_eq!(framed.len(), 40);
        assert_eq!(read_blocks(&framed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn corruption_names_the_block() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let mut framed = write_blocks(&data, 1024);
        // Flip one payload byte inside the second block.
        let second_payload = 40 + 1024 + 40 + 10;
        framed[second_payload] ^= 0x01;
        assert!(matches!(
            read_blocks(&framed),
            Err(Error::BlockHashMismatch { index: 1 })
        ));
    }

    #[test]
    fn truncated_stream_is_detected() {
        let framed = write_blocks(b"some data", DEFAULT_BLOCK_SIZE);
        assert!(read_blocks(&framed[..framed.len() - 4]).is_err());
    }
}
