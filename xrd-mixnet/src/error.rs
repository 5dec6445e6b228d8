use xrd_util::gate::Aborted;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MixError {
    #[error("round {0} not initialized")]
    RoundNotInitialized(u64),

    #[error("round {0} already exists")]
    RoundExists(u64),

    #[error("invalid client proof")]
    BadClientProof,

    #[error("invalid shuffle proof from cascade position {0}")]
    BadShuffleProof(usize),

    #[error("failed to open an onion layer")]
    OpenFailed,

    #[error("failed to open an inner ciphertext")]
    InnerOpenFailed,

    #[error("key material unavailable for round {0}")]
    KeyUnavailable(u64),

    #[error("operation out of order: {0}")]
    StateViolation(&'static str),

    #[error("round aborted")]
    RoundAborted,

    #[error("could not build worker pool")]
    Pool,
}

impl From<Aborted> for MixError {
    fn from(_: Aborted) -> Self {
        MixError::RoundAborted
    }
}
