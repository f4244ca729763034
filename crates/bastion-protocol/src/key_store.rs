//! Key material storage
//!
//! Each peer relationship owns exactly one slot. A new key agreement
//! overwrites the slot; nothing is ever merged across identities.
//!
//! Two stores share the [`KeyStore`] trait:
//! - [`MemoryKeyStore`]: a mutex-guarded map, for clients and tests
//! - [`FileKeyStore`]: one directory per peer under a root, holding `key`,
//!   `iv`, `owner` and `created`

use bastion_crypto::{SessionCipher, IV_SIZE, KEY_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::{ProtocolError, ProtocolResult};
use crate::identity::PeerId;

/// Symmetric key and IV agreed with one peer
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    owner_id: String,
    created_at: u64,
}

impl KeyMaterial {
    /// New material stamped with the current time
    pub fn new(owner_id: impl Into<String>, key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self::with_created_at(owner_id, key, iv, unix_now())
    }

    fn with_created_at(
        owner_id: impl Into<String>,
        key: [u8; KEY_SIZE],
        iv: [u8; IV_SIZE],
        created_at: u64,
    ) -> Self {
        Self {
            key,
            iv,
            owner_id: owner_id.into(),
            created_at,
        }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Creation time, seconds since the Unix epoch
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Cipher bound to this key and IV
    pub fn cipher(&self) -> SessionCipher {
        SessionCipher::new(self.key, self.iv)
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        unix_now().saturating_sub(self.created_at) > ttl.as_secs()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("owner_id", &self.owner_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Storage of per-peer key material
pub trait KeyStore: Send + Sync {
    /// Store material for `peer`, replacing any previous slot
    fn put(&self, peer: &PeerId, material: KeyMaterial) -> ProtocolResult<()>;

    /// Material for `peer`, or `KeyMaterialNotFound` if absent or expired
    fn get(&self, peer: &PeerId) -> ProtocolResult<KeyMaterial>;

    /// Drop the slot; returns whether one existed
    fn remove(&self, peer: &PeerId) -> ProtocolResult<bool>;

    /// Evict expired slots; returns how many were removed
    fn sweep_expired(&self) -> ProtocolResult<usize>;
}

/// In-memory key store
#[derive(Default)]
pub struct MemoryKeyStore {
    slots: Mutex<HashMap<PeerId, KeyMaterial>>,
    ttl: Option<Duration>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose entries expire `ttl` after creation
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn put(&self, peer: &PeerId, material: KeyMaterial) -> ProtocolResult<()> {
        self.slots.lock().insert(peer.clone(), material);
        Ok(())
    }

    fn get(&self, peer: &PeerId) -> ProtocolResult<KeyMaterial> {
        let mut slots = self.slots.lock();
        let expired = match slots.get(peer) {
            None => return Err(ProtocolError::KeyMaterialNotFound(peer.to_string())),
            Some(material) => self.ttl.map_or(false, |ttl| material.is_expired(ttl)),
        };
        if expired {
            slots.remove(peer);
            return Err(ProtocolError::KeyMaterialNotFound(peer.to_string()));
        }
        slots
            .get(peer)
            .cloned()
            .ok_or_else(|| ProtocolError::KeyMaterialNotFound(peer.to_string()))
    }

    fn remove(&self, peer: &PeerId) -> ProtocolResult<bool> {
        Ok(self.slots.lock().remove(peer).is_some())
    }

    fn sweep_expired(&self) -> ProtocolResult<usize> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, material| !material.is_expired(ttl));
        Ok(before - slots.len())
    }
}

const KEY_FILE: &str = "key";
const IV_FILE: &str = "iv";
const OWNER_FILE: &str = "owner";
const CREATED_FILE: &str = "created";

/// Directory-backed key store
///
/// Peer identities are hex-encoded into directory names, so every
/// relationship gets its own isolated slot regardless of the characters in
/// its name.
pub struct FileKeyStore {
    root: PathBuf,
    ttl: Option<Duration>,
    lock: Mutex<()>,
}

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>, ttl: Option<Duration>) -> ProtocolResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            ttl,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_dir(&self, peer: &PeerId) -> PathBuf {
        self.root.join(hex::encode(peer.as_str()))
    }

    fn read_slot(dir: &Path) -> ProtocolResult<KeyMaterial> {
        let key = Zeroizing::new(fs::read(dir.join(KEY_FILE))?);
        let iv = fs::read(dir.join(IV_FILE))?;
        let owner = fs::read_to_string(dir.join(OWNER_FILE))?;
        let created = fs::read_to_string(dir.join(CREATED_FILE))?;

        let key: [u8; KEY_SIZE] = key.as_slice().try_into().map_err(|_| {
            ProtocolError::Crypto(bastion_crypto::CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                got: key.len(),
            })
        })?;
        let iv: [u8; IV_SIZE] = iv.as_slice().try_into().map_err(|_| {
            ProtocolError::Crypto(bastion_crypto::CryptoError::InvalidIvLength {
                expected: IV_SIZE,
                got: iv.len(),
            })
        })?;
        let created_at = created
            .trim()
            .parse::<u64>()
            .map_err(|e| ProtocolError::Serialization(format!("bad created stamp: {e}")))?;

        Ok(KeyMaterial::with_created_at(owner, key, iv, created_at))
    }
}

impl KeyStore for FileKeyStore {
    fn put(&self, peer: &PeerId, material: KeyMaterial) -> ProtocolResult<()> {
        let _guard = self.lock.lock();
        let dir = self.slot_dir(peer);
        fs::create_dir_all(&dir)?;
        write_private(&dir.join(KEY_FILE), material.key())?;
        write_private(&dir.join(IV_FILE), material.iv())?;
        fs::write(dir.join(OWNER_FILE), material.owner_id())?;
        fs::write(dir.join(CREATED_FILE), material.created_at().to_string())?;
        debug!("Stored key material for {}", peer.short());
        Ok(())
    }

    fn get(&self, peer: &PeerId) -> ProtocolResult<KeyMaterial> {
        let _guard = self.lock.lock();
        let dir = self.slot_dir(peer);
        if !dir.is_dir() {
            return Err(ProtocolError::KeyMaterialNotFound(peer.to_string()));
        }
        let material = Self::read_slot(&dir)?;
        if self.ttl.map_or(false, |ttl| material.is_expired(ttl)) {
            fs::remove_dir_all(&dir)?;
            return Err(ProtocolError::KeyMaterialNotFound(peer.to_string()));
        }
        Ok(material)
    }

    fn remove(&self, peer: &PeerId) -> ProtocolResult<bool> {
        let _guard = self.lock.lock();
        let dir = self.slot_dir(peer);
        if !dir.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }

    fn sweep_expired(&self) -> ProtocolResult<usize> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };
        let _guard = self.lock.lock();
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            // Unreadable slots are left for an operator to inspect
            match Self::read_slot(&dir) {
                Ok(material) if material.is_expired(ttl) => {
                    fs::remove_dir_all(&dir)?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }
}

/// Write a file readable only by the owner
fn write_private(path: &Path, data: &[u8]) -> ProtocolResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    Ok(())
}
