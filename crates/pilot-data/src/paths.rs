//! Storage path construction and transfer timing.

use std::time::Duration;

use gridpilot_core::checksum::md5_hex;

/// Deterministic storage path for `scope:lfn`:
/// `<scope parts>/<md5[0:2]>/<md5[2:4]>/<lfn>`, empty parts dropped.
///
/// Pure in its inputs; the same `(scope, lfn)` always maps to the same path.
pub fn deterministic_path(scope: &str, lfn: &str) -> String {
    let hash = md5_hex(&format!("{scope}:{lfn}"));
    let mut parts: Vec<&str> = scope.split('.').filter(|p| !p.is_empty()).collect();
    parts.push(&hash[0..2]);
    parts.push(&hash[2..4]);
    parts.push(lfn);
    parts.join("/")
}

/// Join a base path and a relative part with exactly one separator, like the
/// storage-side path join: `join_path("/atlas/", "a/b")` is `/atlas/a/b`.
pub fn join_path(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return rel.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{rel}")
    } else {
        format!("{base}/{rel}")
    }
}

/// Per-file transfer timeout, monotone in the file size: a flat setup
/// allowance plus the time to move the payload at a conservative 500 kB/s.
pub fn transfer_timeout(filesize: u64) -> Duration {
    const BASE_SECS: u64 = 600;
    const BYTES_PER_SEC: u64 = 500_000;
    Duration::from_secs(BASE_SECS + filesize / BYTES_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_path_is_stable_and_slash_free() {
        let first = deterministic_path("user.x", "f.root");
        let second = deterministic_path("user.x", "f.root");
        assert_eq!(first, second);
        assert!(!first.contains("//"));

        let parts: Vec<&str> = first.split('/').collect();
        assert_eq!(parts[0], "user");
        assert_eq!(parts[1], "x");
        assert_eq!(parts[2].len(), 2);
        assert_eq!(parts[3].len(), 2);
        assert_eq!(parts[4], "f.root");

        let hash = md5_hex("user.x:f.root");
        assert_eq!(parts[2], &hash[0..2]);
        assert_eq!(parts[3], &hash[2..4]);
    }

    #[test]
    fn empty_scope_parts_are_dropped() {
        let path = deterministic_path("mc16..prod", "a.root");
        assert!(!path.contains("//"));
        assert!(path.starts_with("mc16/prod/"));
    }

    #[test]
    fn join_path_never_doubles_the_separator_it_adds() {
        assert_eq!(join_path("/atlas/", "user/x"), "/atlas/user/x");
        assert_eq!(join_path("/atlas", "user/x"), "/atlas/user/x");
        assert_eq!(join_path("", "user/x"), "user/x");
        assert_eq!(join_path("/atlas", ""), "/atlas");
    }

    #[test]
    fn timeout_grows_with_filesize() {
        assert!(transfer_timeout(0) < transfer_timeout(10_000_000_000));
        assert_eq!(transfer_timeout(0), Duration::from_secs(600));
    }
}
