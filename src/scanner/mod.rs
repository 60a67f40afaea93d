pub mod discovery;
pub mod hashing;

pub use discovery::{extension_matcher, scan_in_batches, BatchedPaths, ScanError};
pub use hashing::{hash_len, perceptual_hash};
