use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insufficient history to fit a model or compute a baseline.
    /// Handled per-entity/per-channel: degrade to null/low-confidence,
    /// never abort the run.
    #[error("Data gap for '{scope}': {needed} rows needed, {got} available")]
    DataGap {
        scope: String,
        needed: usize,
        got: usize,
    },

    /// Regression failed to converge or produced a degenerate fit.
    /// The affected channel's coefficient is marked unavailable;
    /// other channels proceed.
    #[error("Model divergence for channel '{channel}': {reason}")]
    ModelDivergence { channel: String, reason: String },

    /// The lifecycle state machine rejected an out-of-order transition.
    /// Surfaced to the caller; no mutation applied.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// An insight_hash collision attempted a plain insert. The store
    /// resolves these with upsert semantics; this variant exists for
    /// callers that bypass the upsert path.
    #[error("Duplicate insight write for hash {hash}")]
    DuplicateWrite { hash: String },

    /// A source read exceeded its deadline after bounded retries.
    /// The run fails with a clear status, never a partial silent success.
    #[error("Upstream read '{src}' failed after {attempts} attempts: {detail}")]
    UpstreamTimeout {
        src: String,
        attempts: u32,
        detail: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
