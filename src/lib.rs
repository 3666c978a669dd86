pub mod api;
pub mod chunker;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod pipeline;
pub mod recorder;
pub mod retention;

// Re-export main components for easier use
pub use config::{EventDefinition, StreamConfig};
pub use db::models::DetectedEvent;
pub use error::Error;
pub use pipeline::{PipelineController, PipelineState, PipelineStatus};
