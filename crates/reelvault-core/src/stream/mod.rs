//! Range-streaming support: admission control, path cache, range math

pub mod admission;
pub mod path_cache;
pub mod range;

pub use admission::{StreamAdmission, StreamSlot};
pub use path_cache::ScenePathCache;
pub use range::{content_type, parse_range, resolve_range, RangeRequest, ResolvedRange};

/// Copy buffer size for streaming bodies
pub const STREAM_BUFFER_SIZE: usize = 256 * 1024;
