//! Error types for the RA-TLS proxy.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The upstream certificate carries no quote, or an empty one.
    #[error("attestation quote missing: {0}")]
    QuoteMissing(String),

    #[error("unable to parse upstream certificate: {0}")]
    CertificateUnparsable(String),

    #[error("quote verification failed: {0}")]
    VerificationFailed(String),

    /// A bounded connection phase ran out of time. Carries the phase name.
    #[error("{0} timed out")]
    HandshakeTimeout(&'static str),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("session cancelled by shutdown")]
    Cancelled,
}

impl Error {
    /// Whether the error is a gating decision against the upstream rather than
    /// a local or shutdown condition.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::QuoteMissing(_)
                | Self::CertificateUnparsable(_)
                | Self::VerificationFailed(_)
                | Self::HandshakeTimeout(_)
                | Self::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
