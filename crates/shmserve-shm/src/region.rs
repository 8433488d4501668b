//! Named shared memory regions.
//!
//! Every region is a file in the shm directory (normally under `/dev/shm`)
//! mapped `MAP_SHARED`, so any process on the host that knows the directory
//! and the name can attach to it.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::{Result, ShmError};

pub struct SharedRegion {
    name: String,
    path: PathBuf,
    mmap: MmapMut,
    _file: File,
}

impl SharedRegion {
    /// Creates (or truncates) a region of `len` bytes, zero-filled.
    pub fn create(dir: &Path, name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ShmError::Layout(format!("region {name} has zero length")));
        }
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was just sized to `len`; other processes only ever
        // map it, they never shrink it while the arena is alive.
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

        Ok(Self {
            name: name.to_string(),
            path,
            mmap,
            _file: file,
        })
    }

    /// Maps an existing region by name.
    pub fn attach(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShmError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(ShmError::Layout(format!("region {name} is empty")));
        }

        // SAFETY: `len` is the current file size; see `create`.
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

        Ok(Self {
            name: name.to_string(),
            path,
            mmap,
            _file: file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Copies `src` into the start of the region in one pass.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        let len = self.len();
        let dst = self
            .mmap
            .get_mut(..src.len())
            .ok_or_else(|| {
                ShmError::Layout(format!(
                    "{} bytes do not fit region {} of {} bytes",
                    src.len(),
                    self.name,
                    len
                ))
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
