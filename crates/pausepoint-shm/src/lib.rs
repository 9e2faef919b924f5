//! Named shared-memory regions.
//!
//! Provides:
//! - `Region` - One mapped POSIX shared-memory object with a length-prefixed frame
//! - `RegionRegistry` - Process-local table of created and attached regions

pub mod error;
#[allow(unsafe_code)]
pub mod region;
pub mod registry;

pub use error::RegionError;
pub use region::{HEADER_LEN, Provenance, Region};
pub use registry::{PutOutcome, RegionRegistry};
