pub mod config;
pub mod data;
pub mod discovery;
pub mod error;
pub mod framework;
pub mod parser;
pub mod process;
pub mod runner;

pub use error::{Error, Result};
