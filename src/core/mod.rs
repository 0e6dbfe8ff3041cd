//! Core types: configuration, constants, and error taxonomy.

pub mod config;
pub mod constants;
pub mod error;

pub use config::TransportConfig;
pub use error::{FrameError, QuiverError, RegistryError, SendError, StreamError};
