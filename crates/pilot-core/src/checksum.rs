//! Checksum helpers used by the movers and the event-service uploader.

use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::{ErrorCode, PilotError};

/// Hex MD5 of a string, as used for deterministic storage paths.
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Adler-32 of a file, zero-padded to eight hex digits.
pub fn adler32_file(path: &Path) -> Result<String, PilotError> {
    let file = std::fs::File::open(path).map_err(|err| {
        PilotError::new(ErrorCode::FileHandlingFailure)
            .with_kwarg("reason", format!("open {}: {err}", path.display()))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = adler32::RollingAdler32::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|err| {
            PilotError::new(ErrorCode::FileHandlingFailure)
                .with_kwarg("reason", format!("read {}: {err}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        hasher.update_buffer(&buf[..n]);
    }
    Ok(format!("{:08x}", hasher.hash()))
}

/// MD5 of a file, hex encoded.
pub fn md5_file(path: &Path) -> Result<String, PilotError> {
    let file = std::fs::File::open(path).map_err(|err| {
        PilotError::new(ErrorCode::FileHandlingFailure)
            .with_kwarg("reason", format!("open {}: {err}", path.display()))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|err| {
            PilotError::new(ErrorCode::FileHandlingFailure)
                .with_kwarg("reason", format!("read {}: {err}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

/// Checksum a file with the named algorithm (`adler32` or `md5`).
pub fn calculate_checksum(path: &Path, algorithm: &str) -> Result<String, PilotError> {
    match algorithm {
        "adler32" => adler32_file(path),
        "md5" => md5_file(path),
        other => Err(PilotError::new(ErrorCode::NotDefined)
            .with_detail(format!("unsupported checksum algorithm: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_matches_known_vector() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn adler32_of_wikipedia_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w");
        std::fs::write(&path, "Wikipedia").unwrap();
        assert_eq!(adler32_file(&path).unwrap(), "11e60398");
    }

    #[test]
    fn empty_file_is_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, "").unwrap();
        assert_eq!(adler32_file(&path).unwrap(), "00000001");
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "x").unwrap();
        let err = calculate_checksum(&path, "crc32").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotDefined);
    }
}
