//! Video capture and frame processing

pub mod capture;
pub mod convert;
pub mod encode;
pub mod format;
pub mod motion;
pub mod pool;

pub use capture::{CaptureConfig, CaptureSource};
pub use encode::DisplayFrame;
pub use format::{PixelFormat, Resolution};
pub use motion::MotionGate;
pub use pool::{Consumer, FrameRef};
