//! Read-back path: fetch previously-exported traces from the OTLP backend's
//! HTTP query API (Tempo's `/api/traces/{id}` in the baseline) and convert
//! them back into the pipeline's domain model.

pub mod client;
pub mod model;

pub use client::{ReadbackClient, ReadbackError};
