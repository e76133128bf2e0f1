//! # attache-core
//!
//! Core types shared by every Attache crate:
//! - the operation context threaded through upload and delete calls
//! - record identity and metadata maps
//! - validation error collections
//! - process configuration

pub mod config;
pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
