pub mod cli;
pub mod commands;
pub mod error;
pub mod frontend;
pub mod model;
pub mod storage;

pub use error::{Error, Result};
