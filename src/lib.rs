pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod storage;
pub mod throttle;

pub use config::Config;
pub use error::{Error, Result};
