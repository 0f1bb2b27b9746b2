//! # parley-shared
//!
//! Types shared by the Parley store and delivery core: identifiers,
//! message payloads, send states, the peer wire envelope and the local
//! signing identity.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{IdentityError, ProtocolError};
pub use identity::Identity;
pub use types::*;
