//! sidecast client — receive, decode, and present a sidecast stream while
//! forwarding touch input back to the host.

pub mod client;
pub mod decoder;
pub mod touch;

pub use client::{ClientCallbacks, StreamClient};
pub use decoder::DecodeStage;
pub use touch::{PointerInput, TouchSampler};
