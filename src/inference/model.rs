//! GGUF header checks
//!
//! The native loader trusts whatever it is given, so files are sniffed here
//! before they ever reach it.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

/// Errors raised while sniffing a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    /// Parses the header from the first bytes of `reader`.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, ModelError> {
        let mut raw = Vec::with_capacity(HEADER_LEN);
        reader.take(HEADER_LEN as u64).read_to_end(&mut raw)?;
        if raw.len() < HEADER_LEN {
            return Err(ModelError::FileTooSmall);
        }

        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let dword = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let magic = word(0);
        if magic != GGUF_MAGIC {
            return Err(ModelError::InvalidMagic(magic));
        }

        let version = word(4);
        if !(2..=3).contains(&version) {
            return Err(ModelError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: dword(8),
            metadata_kv_count: dword(16),
        })
    }
}

/// Opens `path` and checks that it starts with a supported GGUF header.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    GgufHeader::read_from(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn header_bytes(magic: u32, version: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&magic.to_le_bytes());
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&291u64.to_le_bytes());
        bytes.extend_from_slice(&24u64.to_le_bytes());
        bytes
    }

    #[test]
    fn test_validate_gguf_valid() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&header_bytes(GGUF_MAGIC, 3)).unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        file.flush().unwrap();

        let header = validate_gguf(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.metadata_kv_count, 24);
    }

    #[test]
    fn test_invalid_magic() {
        let result = GgufHeader::read_from(&header_bytes(0xDEADBEEF, 3)[..]);
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_unsupported_version() {
        let result = GgufHeader::read_from(&header_bytes(GGUF_MAGIC, 1)[..]);
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_truncated_header() {
        let result = GgufHeader::read_from(&GGUF_MAGIC.to_le_bytes()[..]);
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = validate_gguf(dir.path().join("absent.gguf"));
        assert!(matches!(result, Err(ModelError::FileOpen(_))));
    }
}
