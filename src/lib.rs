//! jitter library crate
//!
//! Runs scripts in an embedded interpreter and, when a call lands on a
//! function that only raises `NotImplementedError`, drafts an implementation,
//! validates it, swaps it into the running program and resumes the caller.

pub mod config;
pub mod confirm;
pub mod error;
pub mod generate;
pub mod inspect;
pub mod keyring;
pub mod patch;
pub mod runtime;
pub mod scan;
pub mod script;
pub mod util;
pub mod workflow;

pub use error::{PatchError, Result};
