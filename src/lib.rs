pub mod batch;
pub mod config;
pub mod error;
pub mod hnsw;
pub mod metric;
pub mod snapshot;
pub mod visited;

pub use config::IndexConfig;
pub use error::Error;
pub use error::Result;
pub use hnsw::HnswIndex;
pub use metric::MetricKind;

/// Internal slot index. Stable for the lifetime of the index; never reused.
pub type NodeId = u32;
/// Caller-assigned external identifier.
pub type Label = u32;
