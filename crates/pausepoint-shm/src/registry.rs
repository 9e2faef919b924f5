//! Process-local registry of shared regions.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::Duration,
};

use pausepoint_core::codec;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Provenance, Region, RegionError};

/// How a `put` was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new region was created with exactly the payload size.
    Created { capacity: usize },
    /// An already tracked region was overwritten in place.
    Updated,
    /// A tracked region was too small and was replaced.
    Reallocated { old_capacity: usize, capacity: usize },
    /// The name already existed system-wide; attached and wrote in full.
    Attached { capacity: usize },
    /// The name already existed system-wide with a smaller capacity; only a
    /// prefix of the payload was stored.
    CapacityMismatch { capacity: usize, intended: usize },
}

impl PutOutcome {
    /// Whether the stored payload is shorter than the one given.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::CapacityMismatch { .. })
    }
}

struct Entry {
    region: Region,
    recorded_len: usize,
}

/// Registry of named shared regions.
///
/// Every operation holds one registry-wide lock for its full duration,
/// system calls included, so writes to the same name from threads of this
/// process never interleave. Nothing here serializes against *other*
/// processes: a region can be created elsewhere between our existence check
/// and our exclusive create, in which case we attach instead.
///
/// Dropping a registry releases (unmaps and unlinks) everything it tracks.
pub struct RegionRegistry {
    table: Mutex<HashMap<String, Entry>>,
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry.
    ///
    /// Never dropped; call [`release_all`](Self::release_all) before exit.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<RegionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Store raw bytes under `name`.
    ///
    /// # Errors
    /// Returns error if the region cannot be created, attached or resized.
    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<PutOutcome, RegionError> {
        let mut table = self.lock();

        if let Some(entry) = table.get_mut(name) {
            if entry.region.capacity() >= bytes.len() {
                entry.recorded_len = entry.region.write(bytes);
                tracing::debug!(region = name, len = bytes.len(), "Updated shared region in place");
                return Ok(PutOutcome::Updated);
            }
        }

        if let Some(stale) = table.get(name) {
            let old_capacity = stale.region.capacity();
            tracing::info!(
                region = name,
                old_capacity,
                len = bytes.len(),
                "Resizing shared region"
            );
            stale.region.unlink()?;
            table.remove(name);

            let (entry, outcome) = create_or_attach(name, bytes)?;
            if let Some(entry) = entry {
                table.insert(name.to_string(), entry);
            }
            return Ok(match outcome {
                PutOutcome::Created { capacity } => PutOutcome::Reallocated {
                    old_capacity,
                    capacity,
                },
                other => other,
            });
        }

        let (entry, outcome) = create_or_attach(name, bytes)?;
        if let Some(entry) = entry {
            table.insert(name.to_string(), entry);
        }
        Ok(outcome)
    }

    /// Read raw bytes stored under `name`, attaching if it is not tracked.
    ///
    /// # Errors
    /// Returns `NotFound` if no region has this name, or `Malformed` if the
    /// region's header is inconsistent.
    pub fn get(&self, name: &str) -> Result<Vec<u8>, RegionError> {
        let mut table = self.lock();

        if let Some(entry) = table.get(name) {
            return entry.region.read();
        }

        let region = Region::attach(name).inspect_err(|e| {
            if e.is_not_found() {
                tracing::debug!(region = name, "Shared region not found");
            }
        })?;
        let payload = region.read();
        let recorded_len = payload.as_ref().map_or(region.capacity(), Vec::len);
        table.insert(
            name.to_string(),
            Entry {
                region,
                recorded_len,
            },
        );
        payload
    }

    /// Encode `value` and store it under `name`.
    ///
    /// # Errors
    /// Returns `EncodeFailed` if the value cannot be encoded, or any `put` error.
    pub fn share<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<PutOutcome, RegionError> {
        let bytes = codec::encode(value).map_err(|source| RegionError::EncodeFailed {
            name: name.to_string(),
            source,
        })?;
        self.put(name, &bytes)
    }

    /// Read and decode the value stored under `name`.
    ///
    /// # Errors
    /// Returns `NotFound`, `DecodeFailed`, or any `get` error.
    pub fn retrieve<T: DeserializeOwned>(&self, name: &str) -> Result<T, RegionError> {
        let bytes = self.get(name)?;
        codec::decode(&bytes).map_err(|source| {
            tracing::warn!(region = name, error = %source, "Failed to decode shared region");
            RegionError::DecodeFailed {
                name: name.to_string(),
                source,
            }
        })
    }

    /// Alias of [`share`](Self::share).
    ///
    /// # Errors
    /// See [`share`](Self::share).
    pub fn send<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<PutOutcome, RegionError> {
        self.share(name, value)
    }

    /// Alias of [`retrieve`](Self::retrieve).
    ///
    /// # Errors
    /// See [`retrieve`](Self::retrieve).
    pub fn receive<T: DeserializeOwned>(&self, name: &str) -> Result<T, RegionError> {
        self.retrieve(name)
    }

    /// Release one tracked region. Returns `false` if it was not tracked.
    ///
    /// # Errors
    /// Returns a system error if unlinking fails for a reason other than the
    /// name already being gone.
    pub fn release(&self, name: &str) -> Result<bool, RegionError> {
        let Some(entry) = self.lock().remove(name) else {
            return Ok(false);
        };
        entry.region.unlink()?;
        Ok(true)
    }

    /// Unmap and unlink every tracked region.
    ///
    /// Names already unlinked by another process count as released. Returns
    /// the number of entries removed; calling it again returns 0.
    pub fn release_all(&self) -> usize {
        let drained: Vec<(String, Entry)> = self.lock().drain().collect();
        let count = drained.len();
        for (name, entry) in drained {
            match entry.region.unlink() {
                Ok(true) => tracing::debug!(region = %name, "Unlinked shared region"),
                Ok(false) => tracing::debug!(region = %name, "Shared region already unlinked"),
                Err(e) => tracing::warn!(region = %name, error = %e, "Failed to unlink shared region"),
            }
        }
        count
    }

    /// Whether `name` is tracked.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Number of tracked regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Capacity of a tracked region.
    #[must_use]
    pub fn capacity(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(|e| e.region.capacity())
    }

    /// Provenance of a tracked region.
    #[must_use]
    pub fn provenance(&self, name: &str) -> Option<Provenance> {
        self.lock().get(name).map(|e| e.region.provenance())
    }

    /// Payload length last written or read by this process.
    #[must_use]
    pub fn recorded_len(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(|e| e.recorded_len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RegionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort_unstable();
        f.debug_struct("RegionRegistry")
            .field("regions", &names)
            .finish()
    }
}

impl Drop for RegionRegistry {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Attempts made to attach to a region whose creator has not sized it yet.
const UNSIZED_ATTACH_ATTEMPTS: u32 = 5;

/// Pause between those attempts.
const UNSIZED_ATTACH_BACKOFF: Duration = Duration::from_millis(2);

/// Create `name` for `bytes`, or attach and write if it already exists.
///
/// No entry is returned when another process created the name but never
/// sized it; nothing is stored and the outcome is a capacity-0 mismatch.
fn create_or_attach(name: &str, bytes: &[u8]) -> Result<(Option<Entry>, PutOutcome), RegionError> {
    match Region::create(name, bytes.len()) {
        Ok(mut region) => {
            let recorded_len = region.write(bytes);
            let capacity = region.capacity();
            Ok((
                Some(Entry {
                    region,
                    recorded_len,
                }),
                PutOutcome::Created { capacity },
            ))
        }
        Err(RegionError::AlreadyExists(_)) => {
            let Some(mut region) = attach_sized(name)? else {
                tracing::warn!(
                    region = name,
                    intended = bytes.len(),
                    "Shared region exists but was never sized; payload not stored"
                );
                return Ok((
                    None,
                    PutOutcome::CapacityMismatch {
                        capacity: 0,
                        intended: bytes.len(),
                    },
                ));
            };
            let capacity = region.capacity();
            let recorded_len = region.write(bytes);
            let outcome = if recorded_len < bytes.len() {
                tracing::warn!(
                    region = name,
                    capacity,
                    intended = bytes.len(),
                    "Attached shared region is too small; payload truncated"
                );
                PutOutcome::CapacityMismatch {
                    capacity,
                    intended: bytes.len(),
                }
            } else {
                tracing::debug!(region = name, capacity, "Shared region already exists, attached");
                PutOutcome::Attached { capacity }
            };
            Ok((
                Some(Entry {
                    region,
                    recorded_len,
                }),
                outcome,
            ))
        }
        Err(e) => Err(e),
    }
}

/// Attach, giving a concurrent creator a short window to size the object.
fn attach_sized(name: &str) -> Result<Option<Region>, RegionError> {
    for attempt in 1..=UNSIZED_ATTACH_ATTEMPTS {
        match Region::attach(name) {
            Ok(region) => return Ok(Some(region)),
            Err(e) if e.is_unsized() => {
                tracing::debug!(region = name, attempt, "Shared region not sized yet");
                thread::sleep(UNSIZED_ATTACH_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
