//! updelta: content-addressed self-update artifacts.
//!
//! A publisher turns a freshly built binary into a distribution tree: a
//! manifest naming the binary's SHA-256 (optionally signed), a gzipped and
//! optionally PGP-encrypted full blob, and one binary delta per previously
//! published binary. A consumer embedded in the running executable polls
//! the tree, patches its own image forward when a delta exists, and falls
//! back to the full blob otherwise. Artifacts are identified by content
//! hash alone; there is no version concept.
//!
//! ```no_run
//! use updelta::{Platform, UpdateConfig, UpdateOutcome, UpdatePipeline};
//!
//! # async fn demo() -> Result<(), updelta::UpdateError> {
//! let config = UpdateConfig::new("https://example.com/myapp", Platform::current());
//! let pipeline = UpdatePipeline::new(config);
//! match pipeline.fetch().await? {
//!     UpdateOutcome::NotNeeded => println!("already current"),
//!     UpdateOutcome::Replacement(bytes) => {
//!         // hand the verified bytes to the process supervisor
//!         let _ = bytes;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod io;
pub mod keyring;
pub mod ops;
pub mod templates;
pub mod types;

pub use io::delta::{DeltaError, DiffCodec, ZstdDelta};
pub use io::fetch::{FetchError, Timeout, Timeouts};
pub use keyring::{KeyringError, KeyringView};
pub use ops::error::{BuildError, UpdateError};
pub use ops::publish::ArtifactBuilder;
pub use ops::update::{UpdateConfig, UpdateOutcome, UpdatePipeline, DEFAULT_INTERVAL};
pub use templates::{TemplateError, TemplateKind, TemplateSet, UrlInfo};
pub use types::{Hash, Hasher, Manifest, Platform};

/// User agent sent with artifact fetches.
pub const USER_AGENT: &str = concat!("updelta/", env!("CARGO_PKG_VERSION"));
