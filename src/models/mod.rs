//! Core data models for the snapshot uploader.
//!
//! These types describe remote objects, in-flight transfers and the
//! incomplete multipart uploads the reaper inspects. They carry no behavior
//! beyond validation and small predicates.

pub mod multipart;
pub mod remote_object;
pub mod transfer;
