//! Client library for the remote generation provider.
//!
//! Provides the REST wrapper used to submit generation jobs and query their
//! status, the [`GenerationProvider`] seam that lets callers swap in a fake,
//! and the cancellable [`poller::poll_task`] loop that blocks until a job
//! reaches a terminal state.

pub mod api;
pub mod poller;

pub use api::{GenerationProvider, ProviderApi, ProviderApiError, SubmitRequest, TaskStatusResponse};
pub use poller::{poll_task, PollError, TaskResult};
