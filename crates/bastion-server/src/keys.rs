//! Service identity on disk
//!
//! `identity/private.pem` (PKCS#8) and `identity/public.pem` (SPKI),
//! generated on first start.

use bastion_crypto::{public_key_from_pem, RsaKeyPair, RsaPublicKey};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::errors::{ServerError, ServerResult};

const PRIVATE_KEY_FILE: &str = "private.pem";
const PUBLIC_KEY_FILE: &str = "public.pem";

/// Load the service key pair from `dir`, generating it if absent
pub fn load_or_create_identity(dir: &Path) -> ServerResult<RsaKeyPair> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    if private_path.exists() {
        let pem = fs::read_to_string(&private_path)?;
        let identity = RsaKeyPair::from_pem(&pem)
            .map_err(|e| ServerError::Identity(format!("{}: {e}", private_path.display())))?;
        info!("Loaded identity from {}", dir.display());
        return Ok(identity);
    }

    let identity = RsaKeyPair::generate()?;
    fs::create_dir_all(dir)?;
    write_private(&private_path, identity.private_key_pem()?.as_bytes())?;
    fs::write(dir.join(PUBLIC_KEY_FILE), identity.public_key_pem()?)?;
    info!("Generated new identity in {}", dir.display());
    Ok(identity)
}

/// Read a counterpart's public key
pub fn load_public_key(path: &Path) -> ServerResult<RsaPublicKey> {
    let pem = fs::read_to_string(path)
        .map_err(|e| ServerError::Identity(format!("{}: {e}", path.display())))?;
    public_key_from_pem(&pem)
        .map_err(|e| ServerError::Identity(format!("{}: {e}", path.display())))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> ServerResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> ServerResult<()> {
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_once_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let identity_dir = dir.path().join("identity");

        let first = load_or_create_identity(&identity_dir).unwrap();
        assert!(identity_dir.join(PRIVATE_KEY_FILE).exists());
        assert!(identity_dir.join(PUBLIC_KEY_FILE).exists());

        let second = load_or_create_identity(&identity_dir).unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let public = load_public_key(&identity_dir.join(PUBLIC_KEY_FILE)).unwrap();
        assert_eq!(&public, first.public_key());
    }

    #[test]
    fn test_missing_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_public_key(&dir.path().join("absent.pem"));
        assert!(matches!(result, Err(ServerError::Identity(_))));
    }

    #[test]
    fn test_corrupt_private_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PRIVATE_KEY_FILE), "garbage").unwrap();
        let result = load_or_create_identity(dir.path());
        assert!(matches!(result, Err(ServerError::Identity(_))));
    }
}
