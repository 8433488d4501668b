use std::path::{Path, PathBuf};

use crate::{IpcError, Result};

/// Where every local channel of one deployment lives.
#[derive(Clone, Debug)]
pub struct SocketLayout {
    dir: PathBuf,
}

impl SocketLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Slot Acquire/Release channel served by the pool manager.
    pub fn control(&self) -> PathBuf {
        self.dir.join("memory.sock")
    }

    /// Inference-request channel of worker `index`.
    pub fn inference(&self, index: usize) -> PathBuf {
        self.dir.join(format!("inference-{index}.sock"))
    }

    pub fn reply_dir(&self) -> PathBuf {
        self.dir.join("reply")
    }

    /// Completion address bound by the handler that owns `client_id`.
    pub fn reply(&self, client_id: &str) -> Result<PathBuf> {
        validate_client_id(client_id)?;
        Ok(self.reply_dir().join(format!("{client_id}.sock")))
    }
}

/// Client ids become file names, so only a conservative alphabet is allowed.
pub fn validate_client_id(client_id: &str) -> Result<()> {
    let ok = !client_id.is_empty()
        && client_id.len() <= 64
        && client_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && !client_id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(IpcError::Malformed(format!("invalid client id {client_id:?}")))
    }
}
