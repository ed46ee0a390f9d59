//! pi-sentry - single-board-computer video surveillance server
//!
//! Captures frames from a local V4L2 camera, optionally detects motion,
//! encodes frames as segmented PNG and streams them to one remote
//! monitoring client, while accepting text commands from that client and
//! raising a rate-limited email alert when motion is first observed.

pub mod config;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod server;
pub mod tty;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
