pub mod backend;
pub mod clock;
pub mod errors;
pub mod settings;
pub mod stats;
pub mod thread;
pub mod types;
pub mod wire;

pub use backend::{
    CaptureSource, DecoderConfig, EncoderConfig, EncoderUpdate, PointerSink, SubmitOutcome,
    VideoDecoder, VideoEncoder,
};
pub use errors::{
    CaptureError, DecodeError, EncodeError, PipelineError, StreamError, WireError,
};
pub use settings::{Quality, StreamSettings};
pub use stats::{FrameIntervalStats, ThroughputWindow};
pub use types::*;
pub use wire::Message;
