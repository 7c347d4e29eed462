//! Core of TakeoutFix: restore Google Photos Takeout metadata from JSON
//! sidecars into the media files themselves, then delete only the sidecars
//! whose metadata was applied successfully.
//!
//! The heart of the crate is the [`resolver`], which decides for every
//! media file in an extracted Takeout tree which sidecar describes it.
//! Around it sit archive validation ([`zipcheck`]), disk-space planning
//! ([`disk`]), resume state ([`state`]), safe extraction ([`extract`]), the
//! external-tool session ([`session`]) and the orchestrating [`pipeline`].

pub mod disk;
pub mod exifcmd;
pub mod extension_fix;
pub mod extract;
pub mod fingerprint;
pub mod mediaext;
pub mod metadata;
pub mod normalize;
pub mod pipeline;
pub mod processor;
pub mod report;
pub mod resolver;
pub mod session;
pub mod state;
pub mod zipcheck;

pub use exifcmd::{ExiftoolResolver, ToolResolver};
pub use pipeline::{EXIT_PREFLIGHT_FAIL, EXIT_RUNTIME_FAIL, EXIT_SUCCESS};
pub use report::{RunReport, RunStatus};
pub use resolver::Pairing;
