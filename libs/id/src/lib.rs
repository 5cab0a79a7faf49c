//! # hermes-id
//!
//! Typed identifiers for the hermes enrollment engine.
//!
//! ## ID Format
//!
//! Every entity id uses a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `usr_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `crs_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `sec_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix makes a lecture id impossible to pass where a section id is
//! expected, and the ULID keeps ids roughly time-ordered (millisecond
//! resolution).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
