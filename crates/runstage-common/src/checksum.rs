//! Checksum utilities for archive verification

use crate::error::Result;
use crate::types::ChecksumAlgorithm;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Compute checksum for any readable source, streaming in fixed-size chunks
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    match algorithm {
        ChecksumAlgorithm::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let bytes_read = reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                context.consume(&buffer[..bytes_read]);
            }
            Ok(format!("{:x}", context.compute()))
        },
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let bytes_read = reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }
            Ok(hex::encode(hasher.finalize()))
        },
    }
}

/// Compare two hex digests. Remote services are not consistent about case.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
