//! # wshub-core
//!
//! Core crate for wshub. Contains the settings schemas loaded by the
//! server binary and the unified error system shared by every crate.
//!
//! This crate has **no** internal dependencies on other wshub crates.

pub mod config;
pub mod error;
pub mod result;

pub use error::{ErrorKind, HubError};
pub use result::HubResult;
