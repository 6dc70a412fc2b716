pub mod cancel;
pub mod collab;
pub mod config;
pub mod error;
pub mod jobs;
pub mod local;
pub mod media;
pub mod outcome;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod store;
pub(crate) mod util;

pub use error::{Error, Result};
