//! Read-only file mapping used as a response body.
//!
//! The mapping is acquired when a response is built and released
//! (munmap) when the value is dropped, which happens once the write path
//! has flushed the body or the connection is torn down.

use std::ffi::c_void;
use std::fmt;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

pub struct MappedFile {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the region is PROT_READ and MAP_PRIVATE; nothing writes to it
// for the lifetime of the value, so sharing or moving it across threads
// is sound.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map the whole of `path`.
    ///
    /// Returns `Ok(None)` for an empty file (there is nothing to map).
    pub fn open(path: &Path) -> io::Result<Option<Self>> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        match NonZeroUsize::new(len) {
            Some(len) => Self::map(&file, len).map(Some),
            None => Ok(None),
        }
    }

    /// Map the first `len` bytes of an open file.
    ///
    /// The descriptor can be closed afterwards; the mapping stays valid.
    pub fn map(file: &File, len: NonZeroUsize) -> io::Result<Self> {
        // SAFETY: a fresh private read-only mapping, not aliased by any
        // Rust reference until `as_slice`.
        let ptr = unsafe {
            mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE, file, 0)
        }
        .map_err(io::Error::from)?;
        Ok(Self {
            ptr,
            len: len.get(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap.
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

impl fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}
