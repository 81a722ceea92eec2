//! IMAProxy Common - Shared types and utilities
//!
//! This crate provides the configuration and error types shared by the
//! proxy core and the server binary.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
