pub mod archive;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod kconfig;
pub mod manifest;
pub mod modules;
pub mod planner;
pub mod staging;
pub mod template;
pub mod workspace;

pub use error::{Error, Result};
