//! Error hierarchy for coordination recipes.
//!
//! CAS losses are never surfaced as errors; they drive the recipes' retry
//! loops. Everything that does surface falls into one of the variants below.

use snafu::Snafu;

use crate::store::StoreError;

/// Errors returned by recipe operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RecipeError {
    /// The instance (or its connector) has been closed.
    #[snafu(display("operation invoked on a closed instance"))]
    AlreadyClosed,

    /// A constructor argument failed validation.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// A store RPC failed for a reason other than a lost compare.
    #[snafu(display("store unavailable: {source}"))]
    StoreUnavailable { source: StoreError },

    /// A wait was aborted by close or cancellation.
    #[snafu(display("wait interrupted by close"))]
    Interrupted,

    /// An operation was invoked from a state that does not permit it.
    #[snafu(display("illegal state: {reason}"))]
    IllegalState { reason: String },

    /// A stored value could not be decoded.
    #[snafu(display("corrupted data at '{key}': {reason}"))]
    CorruptedData { key: String, reason: String },
}

/// Result alias used throughout the crate.
pub type Result<T, E = RecipeError> = std::result::Result<T, E>;
