//! Process output capture: line reassembly and stream attachment

pub mod controller;
pub mod line_buffer;

pub use controller::{
    CaptureController, CaptureHealth, CaptureStats, LineCallback, StreamSource,
};
pub use line_buffer::{BufferHealth, LineBuffer, LineBufferStats};
