//! Last-applied desired-state snapshot
//!
//! After every successful fetch the desired document is written to
//! `firewall.output_file`, wrapped with the fetch time and a SHA-256
//! checksum. Only the latest snapshot is kept; there is no history.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// On-disk snapshot format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedSnapshot {
    pub fetched_at: chrono::DateTime<chrono::Utc>,
    /// SHA-256 of the compact JSON encoding of `document`
    pub checksum: String,
    pub document: Value,
}

impl AppliedSnapshot {
    pub fn new(document: Value) -> Self {
        Self {
            fetched_at: chrono::Utc::now(),
            checksum: compute_checksum(&document),
            document,
        }
    }

    pub fn verify(&self) -> bool {
        compute_checksum(&self.document) == self.checksum
    }
}

/// Computes SHA-256 checksum of a JSON value.
///
/// The checksum is computed on the compact JSON string representation.
pub fn compute_checksum(document: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Writes a snapshot using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub fn save_snapshot(path: &Path, snapshot: &AppliedSnapshot) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(snapshot)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.write_all(json.as_bytes())?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    debug!(path = %path.display(), checksum = %snapshot.checksum, "snapshot written");
    Ok(())
}

/// Reads a snapshot back and checks its checksum.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read, is not a snapshot, or its
/// checksum does not match the document.
pub fn load_snapshot(path: &Path) -> Result<AppliedSnapshot> {
    let content = std::fs::read_to_string(path)?;
    let snapshot: AppliedSnapshot = serde_json::from_str(&content)
        .map_err(|e| Error::parse("snapshot", e.to_string(), &content))?;

    if !snapshot.verify() {
        return Err(Error::Internal(format!(
            "snapshot checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_is_stable() {
        let doc = json!({"firewall": {"rules": []}});
        assert_eq!(compute_checksum(&doc), compute_checksum(&doc.clone()));
        assert_eq!(compute_checksum(&doc).len(), 64);
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = json!({"firewall": {"rules": []}});
        let b = json!({"firewall": {"rules": [{"port": "22"}]}});
        assert_ne!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("last_applied.json");
        let snapshot = AppliedSnapshot::new(json!({"firewall": {"rules": [{"port": "22"}]}}));

        save_snapshot(&path, &snapshot).unwrap();
        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_applied.json");
        save_snapshot(&path, &AppliedSnapshot::new(json!({}))).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_applied.json");
        let mut snapshot = AppliedSnapshot::new(json!({"firewall": {"rules": []}}));
        snapshot.document = json!({"firewall": {"rules": [{"port": "1"}]}});
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        assert!(matches!(load_snapshot(&path), Err(Error::Internal(_))));
    }

    #[test]
    fn test_overwrite_keeps_only_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_applied.json");
        save_snapshot(&path, &AppliedSnapshot::new(json!({"n": 1}))).unwrap();
        save_snapshot(&path, &AppliedSnapshot::new(json!({"n": 2}))).unwrap();
        assert_eq!(load_snapshot(&path).unwrap().document["n"], 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
