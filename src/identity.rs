//! Durable receiver identity.
//!
//! Registration persists two files under the config directory: the identity
//! record (`identity.json`) and the registry shared secret (`password`), both
//! 0600. Registration is atomic from the client's view: each file is written
//! via temp file + fsync + rename, and a half-present pair is treated as
//! absent on load.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Satellite;

pub const IDENTITY_FILE: &str = "identity.json";
pub const PASSWORD_FILE: &str = "password";

/// The registered identity of this receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverIdentity {
    /// Server-assigned identifier, immutable once registered
    pub uuid: String,

    /// Key identifier, immutable once registered
    pub fingerprint: String,

    /// Satellite this receiver was registered for
    pub satellite: Satellite,

    /// Coarse location string, human-entered
    pub address: String,
}

/// Identity plus the registry shared secret, loaded together.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: ReceiverIdentity,
    pub password: String,
}

fn identity_path(cfg_dir: &Path) -> PathBuf {
    cfg_dir.join(IDENTITY_FILE)
}

fn password_path(cfg_dir: &Path) -> PathBuf {
    cfg_dir.join(PASSWORD_FILE)
}

/// Load the durable credentials, if registration completed before.
///
/// A lone identity or password file violates the all-or-nothing invariant;
/// it is reported and treated as not registered.
pub fn load(cfg_dir: &Path) -> anyhow::Result<Option<Credentials>> {
    let id_path = identity_path(cfg_dir);
    let pwd_path = password_path(cfg_dir);

    match (id_path.exists(), pwd_path.exists()) {
        (true, true) => {}
        (false, false) => return Ok(None),
        (id, _) => {
            let present = if id { IDENTITY_FILE } else { PASSWORD_FILE };
            warn!("found {present} without its counterpart; ignoring stale registration state");
            return Ok(None);
        }
    }

    let identity: ReceiverIdentity = serde_json::from_str(&std::fs::read_to_string(&id_path)?)
        .map_err(|e| anyhow::anyhow!("invalid {}: {e}", id_path.display()))?;
    let password = String::from_utf8(std::fs::read(&pwd_path)?)
        .map_err(|_| anyhow::anyhow!("invalid {}", pwd_path.display()))?;

    Ok(Some(Credentials { identity, password }))
}

/// Persist the registration outcome. Both files are written atomically.
pub fn persist(cfg_dir: &Path, identity: &ReceiverIdentity, password: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(cfg_dir)?;

    let identity_json = serde_json::to_vec_pretty(identity)?;
    write_atomic(&identity_path(cfg_dir), &identity_json)?;
    write_atomic(&password_path(cfg_dir), password.as_bytes())?;
    Ok(())
}

/// Write-temp, fsync, rename. The temp file lives in the target directory so
/// the rename stays on one filesystem.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file")
    ));

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    restrict_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> ReceiverIdentity {
        ReceiverIdentity {
            uuid: "abc".to_string(),
            fingerprint: "F00D".to_string(),
            satellite: Satellite::Galaxy18,
            address: "Porto Alegre, RS, Brazil".to_string(),
        }
    }

    #[test]
    fn test_persist_then_load() {
        let dir = tempfile::tempdir().unwrap();

        assert!(load(dir.path()).unwrap().is_none());

        persist(dir.path(), &test_identity(), "P").unwrap();

        let creds = load(dir.path()).unwrap().unwrap();
        assert_eq!(creds.identity, test_identity());
        assert_eq!(creds.password, "P");
    }

    #[test]
    fn test_lone_identity_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &test_identity(), "P").unwrap();
        std::fs::remove_file(dir.path().join(PASSWORD_FILE)).unwrap();

        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_lone_password_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &test_identity(), "P").unwrap();
        std::fs::remove_file(dir.path().join(IDENTITY_FILE)).unwrap();

        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_persist_overwrites_previous_password() {
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &test_identity(), "old").unwrap();
        persist(dir.path(), &test_identity(), "new").unwrap();

        let creds = load(dir.path()).unwrap().unwrap();
        assert_eq!(creds.password, "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &test_identity(), "P").unwrap();

        for name in [IDENTITY_FILE, PASSWORD_FILE] {
            let mode = std::fs::metadata(dir.path().join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{name}");
        }
    }
}
