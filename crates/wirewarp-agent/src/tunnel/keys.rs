//! Tunnel key material.
//!
//! The private key lives in one owner-read-only file shared by both roles.
//! An existing file always wins, so restarts never rotate the identity.

use std::fmt;
use std::path::Path;

use tracing::info;
use wirewarp_core::{WarpError, WarpResult};

use crate::backend::{Invocation, NetworkBackend, Program};
use crate::config::write_private;

#[derive(Clone)]
pub struct KeyPair {
    private_key: String,
    public_key: String,
}

impl KeyPair {
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Load the private key at `path`, generating and persisting one if absent,
/// then derive its public key.
pub fn load_or_generate(backend: &dyn NetworkBackend, path: &Path) -> WarpResult<KeyPair> {
    let private_key = match std::fs::read_to_string(path) {
        Ok(content) => content.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => generate(backend, path)?,
        Err(e) => return Err(WarpError::Io(e)),
    };
    if private_key.is_empty() {
        return Err(WarpError::Config(format!(
            "private key file {} is empty",
            path.display()
        )));
    }

    let out = backend.run(&Invocation::new(Program::Wg, ["pubkey"]).with_stdin(private_key.clone()))?;
    let public_key = out.stdout.trim().to_string();

    Ok(KeyPair {
        private_key,
        public_key,
    })
}

fn generate(backend: &dyn NetworkBackend, path: &Path) -> WarpResult<String> {
    if let Some(dir) = path.parent() {
        ensure_private_dir(dir)?;
    }
    let out = backend.run(&Invocation::new(Program::Wg, ["genkey"]))?;
    let key = out.stdout.trim().to_string();
    write_private(path, format!("{key}\n").as_bytes())?;
    info!(path = %path.display(), "generated new tunnel private key");
    Ok(key)
}

pub(crate) fn ensure_private_dir(dir: &Path) -> WarpResult<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;

    #[test]
    fn generates_once_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wireguard").join("wirewarp.key");
        let backend = FakeBackend::new();

        let first = load_or_generate(&backend, &path).unwrap();
        assert_eq!(first.private_key(), "privkey-1=");
        assert_eq!(first.public_key(), "pub-privkey-1=");

        let second = load_or_generate(&backend, &path).unwrap();
        assert_eq!(second.private_key(), first.private_key());
        assert_eq!(
            backend.log().iter().filter(|l| *l == "wg genkey").count(),
            1
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn existing_key_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirewarp.key");
        std::fs::write(&path, "EXISTING=\n").unwrap();

        let keys = load_or_generate(&FakeBackend::new(), &path).unwrap();
        assert_eq!(keys.private_key(), "EXISTING=");
        assert!(!format!("{keys:?}").contains("EXISTING"));
    }
}
