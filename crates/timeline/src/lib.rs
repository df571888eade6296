//! Timeline correlator.
//!
//! Turns the raw per-source buffers of one recording session into a [`Timeline`]: own-traffic
//! filtering, message normalization, merge, stable sort by relative time, adjacent-duplicate
//! collapsing, per-category summary and key-issue ranking. The transformation is pure and
//! deterministic; identical input always serializes to identical output.

pub mod api;
pub mod errors;
pub mod model;
pub mod policy;
pub mod stitch;

pub use api::{correlate, Correlator};
pub use bugtrail_core_types::Timeline;
pub use errors::{TlError, TlResult};
pub use model::{RawBuffers, RecordingWindow};
pub use policy::CorrelatorPolicy;
