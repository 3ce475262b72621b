//! SassMaster: a sarcastic chat bot and an art generator behind a free quota
//!
//! Each client gets a fixed number of free image generations. The
//! [`quota::QuotaLedger`] decides, atomically and per client, whether one more
//! paid call may run, and the handlers in [`app`] turn that decision into the
//! HTTP contract the front end expects.

pub mod ai;
pub mod app;
pub mod error;
pub mod image;
pub mod models;
pub mod photos;
pub mod prompts;
pub mod quota;

pub use error::{Error, QuotaError, Result};
