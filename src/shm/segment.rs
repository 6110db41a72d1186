// File-backed named memory segments
//
// A segment is a file under the shm directory mapped read-write. The creating
// process owns the name and unlinks it on drop; attached peers only unmap.

use std::fs::OpenOptions;
use std::ops::Range;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};

use crate::error::{Result, StageError};

pub struct Segment {
    name: String,
    path: PathBuf,
    map: MmapMut,
    owner: bool,
}

impl Segment {
    /// Create (or take over) a segment of `size` zeroed bytes
    pub fn create(dir: &Path, name: &str, size: usize) -> Result<Self> {
        let path = segment_path(dir, name)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o666)
            .open(&path)?;
        file.set_len(size as u64)?;

        // SAFETY: the file stays open for the lifetime of the mapping; concurrent
        // modification by peers is expected and only accessed through volatile
        // reads and atomics.
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        map.fill(0);

        info!("Created shared memory segment '{}' ({} bytes)", name, size);
        Ok(Self {
            name: name.to_string(),
            path,
            map,
            owner: true,
        })
    }

    /// Attach to a segment created by another process
    pub fn attach(dir: &Path, name: &str, min_size: usize) -> Result<Self> {
        let path = segment_path(dir, name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StageError::Shm(format!("cannot attach '{name}': {e}")))?;
        let size = file.metadata()?.len() as usize;
        if size < min_size {
            return Err(StageError::Shm(format!(
                "segment '{name}' is {size} bytes, expected at least {min_size}"
            )));
        }

        // SAFETY: as in create
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        debug!("Attached to shared memory segment '{}'", name);
        Ok(Self {
            name: name.to_string(),
            path,
            map,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn range(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.map.len())
            .ok_or_else(|| {
                StageError::Shm(format!(
                    "access {offset}+{len} outside segment '{}' ({} bytes)",
                    self.name,
                    self.map.len()
                ))
            })?;
        Ok(offset..end)
    }

    /// Copy bytes out; every byte is read exactly once
    pub fn load(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        let base = self.map.as_ptr();
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: range checked above
            *byte = unsafe { base.add(range.start + i).read_volatile() };
        }
        Ok(())
    }

    /// Copy bytes in; every byte is written exactly once
    pub fn store(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let range = self.range(offset, bytes.len())?;
        let base = self.map.as_mut_ptr();
        for (i, byte) in bytes.iter().enumerate() {
            // SAFETY: range checked above
            unsafe { base.add(range.start + i).write_volatile(*byte) };
        }
        Ok(())
    }

    pub fn zero(&mut self, offset: usize, len: usize) -> Result<()> {
        let range = self.range(offset, len)?;
        let base = self.map.as_mut_ptr();
        for i in range {
            // SAFETY: range checked above
            unsafe { base.add(i).write_volatile(0) };
        }
        Ok(())
    }

    /// 64-bit word used as a sequence marker
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        let range = self.range(offset, 8)?;
        let ptr = self.map.as_ptr().wrapping_add(range.start);
        if ptr.align_offset(align_of::<AtomicU64>()) != 0 {
            return Err(StageError::Shm(format!("offset {offset} is not 8-byte aligned")));
        }
        // SAFETY: in bounds, aligned, and the mapping outlives the borrow
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    /// 32-bit word used as a length header
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        let range = self.range(offset, 4)?;
        let ptr = self.map.as_ptr().wrapping_add(range.start);
        if ptr.align_offset(align_of::<AtomicU32>()) != 0 {
            return Err(StageError::Shm(format!("offset {offset} is not 4-byte aligned")));
        }
        // SAFETY: as above
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.owner {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Unlinked shared memory segment '{}'", self.name),
                Err(e) => warn!("Failed to unlink segment '{}': {}", self.name, e),
            }
        }
    }
}

fn segment_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let name = name.trim_start_matches('/');
    if name.is_empty() || name.contains('/') {
        return Err(StageError::Shm(format!("invalid segment name '{name}'")));
    }
    Ok(dir.join(name))
}
