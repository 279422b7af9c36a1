use thiserror::Error;

/// Fatal framing errors. The protocol has no length-prefixed envelope, so
/// none of these are recoverable — the connection must be closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("video frame of {0} bytes exceeds the 5 MiB limit")]
    FrameTooLarge(usize),

    #[error("touch pointer count {0} not in {{1, 2}}")]
    BadPointerCount(u8),

    #[error("touch action {0} not in {{0, 1, 2}}")]
    BadTouchAction(i32),

    #[error("display config invalid: {0}")]
    BadDisplayConfig(String),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    #[error("no client connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no capture source available: {0}")]
    Unavailable(String),

    #[error("capture backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no encoder available: {0}")]
    Unavailable(String),

    #[error("encoder backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no decoder available: {0}")]
    Unavailable(String),

    #[error("decoder backend error: {0}")]
    Backend(String),

    #[error("decoder session rebuild failed: {0}")]
    Reconfigure(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration invalid: {reason}")]
    Config { reason: String },

    #[error("capture start failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("encoder start failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("server start failed: {0}")]
    Server(#[from] StreamError),
}
