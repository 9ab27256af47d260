//! Deferred processing: bulk submission of queued requests.

pub mod client;
pub mod driver;

pub use client::{build_payload, common_deployment, AzureBatchClient, BatchSubmitter, SubmissionError};
pub use driver::{submit_queued, DriverError, LinkSharing, SubmittedBatch};
