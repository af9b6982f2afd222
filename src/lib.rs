pub mod api;
pub mod config;
pub mod convert;
pub mod error;
pub mod forwarding;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
