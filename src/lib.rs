//! Document processing front-end.
//!
//! Accepts document uploads over HTTP and either processes them immediately
//! (extract text, ask a language model for structured output) or stages them
//! in object storage and records a batch request for deferred processing.

pub mod account;
pub mod batch;
pub mod cli;
pub mod clients;
pub mod config;
pub mod stage;
pub mod storage;
pub mod web;
