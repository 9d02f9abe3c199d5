//! Kiln domain logic.
//!
//! Pure, IO-free building blocks shared by the relay supervisor, the
//! generation provider client and the HTTP layer: error types, the session
//! and poll state machines, input validation and the transcoder argument
//! template.

pub mod error;
pub mod polling;
pub mod session;
pub mod transcode;
pub mod types;
