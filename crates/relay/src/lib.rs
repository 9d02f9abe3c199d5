//! Live-stream relay supervisor.
//!
//! Starts ffmpeg subprocesses that relay a live source into rolling HLS
//! output, tracks them in a [`registry::SessionRegistry`] backed by durable
//! marker files, waits for the first playlist before handing out a URL, and
//! kills and cleans up sessions on request or when the subprocess exits on
//! its own.

pub mod cleanup;
pub mod driver;
pub mod error;
pub mod events;
pub mod launcher;
pub mod marker;
pub mod readiness;
pub mod registry;
pub mod supervisor;
pub mod teardown;

#[cfg(test)]
mod test_support;

pub use error::RelayError;
pub use supervisor::{RelayConfig, StreamSupervisor};
