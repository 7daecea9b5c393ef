//! Core value types: content hashes, platforms and the manifest record.

pub mod hash;
pub mod manifest;
pub mod platform;

pub use hash::{Hash, HashError, Hasher};
pub use manifest::Manifest;
pub use platform::Platform;
