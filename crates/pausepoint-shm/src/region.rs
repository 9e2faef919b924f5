//! A single mapped shared-memory region.
//!
//! Layout of every region:
//!
//! ```text
//! +----------------------+------------------------------+
//! | payload length (u64) | payload area (capacity bytes) |
//! +----------------------+------------------------------+
//! ```
//!
//! The length header is little-endian and is written after the payload, so a
//! reader in another process never has to assume the whole capacity is
//! meaningful.

use std::{
    ffi::c_void,
    fs::File,
    num::NonZeroUsize,
    ptr::{self, NonNull},
    sync::atomic::{Ordering, fence},
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink},
        stat::Mode,
    },
};
use serde::{Deserialize, Serialize};

use crate::RegionError;

/// Size of the payload length header.
pub const HEADER_LEN: usize = 8;

/// Longest accepted region name (`NAME_MAX` minus the leading slash and slack).
const MAX_NAME_LEN: usize = 250;

/// Where a tracked region came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Created exclusively by this process.
    Created,
    /// Attached after another process created it.
    Attached,
}

/// A mapped POSIX shared-memory object.
///
/// Dropping a `Region` unmaps it but does not unlink the name; see
/// [`Region::unlink`].
#[derive(Debug)]
pub struct Region {
    name: String,
    ptr: NonNull<c_void>,
    len: usize,
    provenance: Provenance,
}

// SAFETY: the mapping is owned by this value; all access goes through raw
// copies guarded by `&self`/`&mut self`, never through shared references into
// the mapped memory.
unsafe impl Send for Region {}

impl Region {
    /// Create a region exclusively, failing if the name already exists.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if another process owns the name, or a
    /// system error if the object cannot be sized or mapped.
    pub fn create(name: &str, capacity: usize) -> Result<Self, RegionError> {
        let os_name = os_name(name)?;
        let fd = match shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => return Err(RegionError::AlreadyExists(name.to_string())),
            Err(e) => return Err(RegionError::sys(name, "shm_open", e)),
        };

        let file = File::from(fd);
        let len = HEADER_LEN + capacity;
        let mapped = file
            .set_len(len as u64)
            .map_err(|source| RegionError::Io {
                name: name.to_string(),
                source,
            })
            .and_then(|()| map(name, &file, len));

        match mapped {
            Ok(ptr) => {
                tracing::debug!(region = name, capacity, "Created shared region");
                Ok(Self {
                    name: name.to_string(),
                    ptr,
                    len,
                    provenance: Provenance::Created,
                })
            }
            Err(e) => {
                let _ = shm_unlink(os_name.as_str());
                Err(e)
            }
        }
    }

    /// Attach to a region created elsewhere.
    ///
    /// # Errors
    /// Returns `NotFound` if no region has this name, or `Unsized` if the
    /// object is too small to hold a header because its creator has not sized
    /// it yet.
    pub fn attach(name: &str) -> Result<Self, RegionError> {
        let os_name = os_name(name)?;
        let fd = match shm_open(os_name.as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Err(RegionError::NotFound(name.to_string())),
            Err(e) => return Err(RegionError::sys(name, "shm_open", e)),
        };

        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|source| RegionError::Io {
                name: name.to_string(),
                source,
            })?
            .len();
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len >= HEADER_LEN)
            .ok_or_else(|| RegionError::Unsized(name.to_string()))?;

        let ptr = map(name, &file, len)?;
        tracing::debug!(region = name, capacity = len - HEADER_LEN, "Attached shared region");
        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            provenance: Provenance::Attached,
        })
    }

    /// Region name, without the platform prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.len - HEADER_LEN
    }

    /// Whether this process created or attached the region.
    #[must_use]
    pub const fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Write a payload at offset 0, truncating to capacity.
    ///
    /// Returns the number of payload bytes stored.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let stored = bytes.len().min(self.capacity());
        let base = self.base();
        // SAFETY: `stored <= capacity`, so the copy stays inside the mapping;
        // `bytes` is ordinary process memory and cannot overlap it.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(HEADER_LEN), stored);
        }
        fence(Ordering::Release);
        let header = (stored as u64).to_le_bytes();
        // SAFETY: the header occupies the first HEADER_LEN bytes of the mapping.
        unsafe {
            ptr::copy_nonoverlapping(header.as_ptr(), base, HEADER_LEN);
        }
        stored
    }

    /// Read the framed payload.
    ///
    /// # Errors
    /// Returns `Malformed` if the header declares more bytes than the region
    /// can hold.
    pub fn read(&self) -> Result<Vec<u8>, RegionError> {
        let declared = self.declared_len();
        let len = usize::try_from(declared)
            .ok()
            .filter(|&len| len <= self.capacity())
            .ok_or_else(|| RegionError::Malformed {
                name: self.name.clone(),
                reason: format!(
                    "declared payload {declared} exceeds capacity {}",
                    self.capacity()
                ),
            })?;

        let mut out = vec![0u8; len];
        // SAFETY: `len <= capacity`, so the source range lies inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(HEADER_LEN), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Payload length declared by the header.
    #[must_use]
    pub fn declared_len(&self) -> u64 {
        let mut header = [0u8; HEADER_LEN];
        // SAFETY: the header occupies the first HEADER_LEN bytes of the mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.base(), header.as_mut_ptr(), HEADER_LEN);
        }
        fence(Ordering::Acquire);
        u64::from_le_bytes(header)
    }

    /// Remove the name from the system namespace.
    ///
    /// Returns `false` if the name was already gone.
    ///
    /// # Errors
    /// Returns a system error for anything other than "not found".
    pub fn unlink(&self) -> Result<bool, RegionError> {
        unlink_name(&self.name)
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr().cast::<u8>()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` come from a successful mmap owned by this value.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(region = %self.name, error = %e, "Failed to unmap shared region");
        }
    }
}

/// Unlink a region by name. Returns `false` if it did not exist.
///
/// # Errors
/// Returns a system error for anything other than "not found".
pub fn unlink_name(name: &str) -> Result<bool, RegionError> {
    let os_name = os_name(name)?;
    match shm_unlink(os_name.as_str()) {
        Ok(()) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(RegionError::sys(name, "shm_unlink", e)),
    }
}

fn os_name(name: &str) -> Result<String, RegionError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(['/', '\0']) {
        return Err(RegionError::InvalidName(name.to_string()));
    }
    Ok(format!("/{name}"))
}

fn map(name: &str, file: &File, len: usize) -> Result<NonNull<c_void>, RegionError> {
    let length = NonZeroUsize::new(len).ok_or_else(|| RegionError::Malformed {
        name: name.to_string(),
        reason: "zero-length mapping".to_string(),
    })?;
    // SAFETY: a fresh shared mapping of an object we hold open; no Rust
    // references into it exist yet.
    unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|e| RegionError::sys(name, "mmap", e))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn unique_name() -> String {
        format!("pp-region-{}", Uuid::new_v4().simple())
    }

    #[test]
    fn test_create_then_attach_sees_payload() {
        let name = unique_name();
        let mut created = Region::create(&name, 16).unwrap();
        assert_eq!(created.write(b"hello"), 5);

        let attached = Region::attach(&name).unwrap();
        assert_eq!(attached.provenance(), Provenance::Attached);
        assert_eq!(attached.capacity(), 16);
        assert_eq!(attached.read().unwrap(), b"hello");

        assert!(created.unlink().unwrap());
    }

    #[test]
    fn test_exclusive_create_reports_existing() {
        let name = unique_name();
        let region = Region::create(&name, 4).unwrap();
        assert!(matches!(
            Region::create(&name, 4),
            Err(RegionError::AlreadyExists(_))
        ));
        region.unlink().unwrap();
    }

    #[test]
    fn test_attach_before_sizing_is_unsized() {
        let name = unique_name();
        let fd = shm_open(
            format!("/{name}").as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .unwrap();

        let err = Region::attach(&name).unwrap_err();
        assert!(err.is_unsized());

        drop(fd);
        assert!(unlink_name(&name).unwrap());
    }

    #[test]
    fn test_attach_missing_is_not_found() {
        let err = Region::attach(&unique_name()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_write_truncates_to_capacity() {
        let name = unique_name();
        let mut region = Region::create(&name, 3).unwrap();
        assert_eq!(region.write(b"abcdef"), 3);
        assert_eq!(region.read().unwrap(), b"abc");
        region.unlink().unwrap();
    }

    #[test]
    fn test_fresh_region_reads_empty() {
        let name = unique_name();
        let region = Region::create(&name, 0).unwrap();
        assert!(region.read().unwrap().is_empty());
        region.unlink().unwrap();
    }

    #[test]
    fn test_unlink_tolerates_missing() {
        let name = unique_name();
        let region = Region::create(&name, 1).unwrap();
        assert!(region.unlink().unwrap());
        assert!(!region.unlink().unwrap());
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "a/b", "nul\0byte"] {
            assert!(matches!(
                Region::create(name, 1),
                Err(RegionError::InvalidName(_))
            ));
        }
        assert!(matches!(
            Region::attach(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(RegionError::InvalidName(_))
        ));
    }
}
