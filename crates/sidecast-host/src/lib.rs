//! sidecast host — capture a display, encode HEVC, stream it to one client,
//! and turn the client's touch stream into local pointer input.

pub mod adb;
pub mod capture;
pub mod encoder;
pub mod gesture;
pub mod inject;
pub mod pipeline;
pub mod server;

pub use pipeline::{HostPipeline, PipelineState, PipelineStatus};
pub use server::{ServerCallbacks, StreamServer};
