//! Snapshot uploader: keeps the remote copies of snapshot files alive in an
//! S3-compatible object store.
//!
//! A backup session freshens objects that already exist remotely with an
//! in-place copy, streams the ones that do not, and on teardown aborts
//! multipart uploads abandoned by earlier sessions.

pub mod backends;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod services;

#[cfg(test)]
mod testutil;
