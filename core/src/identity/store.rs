// Identity storage: a single key file on disk

use super::{IdentityError, NodeIdentity};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Owner read-only
#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o400;

/// File-backed store for the node identity
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the identity from disk. Returns `Ok(None)` when no key file exists.
    pub fn load(&self) -> Result<Option<NodeIdentity>, IdentityError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => zeroize::Zeroizing::new(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        NodeIdentity::from_protobuf(&bytes)
            .map(Some)
            .map_err(|e| IdentityError::Decode {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Persist an identity. Fails if a key file already exists.
    pub fn save(&self, identity: &NodeIdentity) -> Result<(), IdentityError> {
        let bytes = identity.to_protobuf()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(KEY_FILE_MODE);
        }

        let mut file = options.open(&self.path).map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Load the identity if the key file exists, otherwise generate one and
    /// persist it before returning. A corrupt key file is an error, never
    /// silently replaced.
    pub fn load_or_create(&self) -> Result<NodeIdentity, IdentityError> {
        if let Some(identity) = self.load()? {
            tracing::info!(
                "🔑 Loaded existing identity {} from {}",
                identity.peer_id(),
                self.path.display()
            );
            return Ok(identity);
        }

        tracing::info!("🔑 Generating new identity at {}", self.path.display());
        let identity = NodeIdentity::generate();
        self.save(&identity)?;
        Ok(identity)
    }

    fn io_error(&self, source: std::io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
