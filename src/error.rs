use thiserror::Error;

/// Execution-layer error taxonomy.
///
/// Leg tasks never surface these directly — every leg resolves to an
/// [`OrderReport`](crate::order::OrderReport) — but the variants tag the
/// failure modes that end up on `BatchResult.error_message` and drive the
/// cancel/hedge/rollback decision logic.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// A pre-flight stage rejected the batch before any order was placed.
    #[error("pre-flight {stage} failed: {message}")]
    PreFlightFailure { stage: String, message: String },

    /// The venue refused an order placement.
    #[error("[{venue}] placement failed: {reason}")]
    PlacementFailure { venue: String, reason: String },

    /// A per-attempt budget expired with zero fills.
    #[error("timed out without fill")]
    TimeoutWithoutFill,

    /// A leg terminated with fills below its target.
    #[error("partial fill")]
    PartialFill,

    /// The hedge path could not flatten sibling exposure.
    #[error("hedge failure: {0}")]
    HedgeFailure(String),

    /// A residual position survived rollback verification.
    #[error("rollback anomaly: {0}")]
    RollbackAnomaly(String),

    /// Sanity-cap or anti-spoof rejection. Logged, never fails the batch.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
