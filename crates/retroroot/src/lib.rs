pub mod buildroot;
pub mod container;
pub mod defconfig;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod logging;
pub mod manifest;
pub mod options;
pub mod orchestrator;
pub mod resolve;

pub use error::{Error, Result};
