//! Data model and error taxonomy for the autopilot execution core.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{ClassifiedError, ErrorCode, ErrorKind, ErrorRecord, Result};
