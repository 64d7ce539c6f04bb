//! Common types for tidemark: CRDs, errors, labels and Kubernetes helpers

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod labels;

pub use error::{Error, UNKNOWN_CONTEXT};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
