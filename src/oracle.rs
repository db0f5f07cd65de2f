//! Attestation verification boundary.
//!
//! The gate only depends on [`AttestationOracle`]; the native DCAP binding in
//! [`crate::dcap`] is one implementation, test doubles are others.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Value every outcome field must hold for a quote to be accepted.
pub const VERIFICATION_SUCCESS: u32 = 0;

/// Result triple reported by a quote verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub status: u32,
    pub collateral_expiration_status: u32,
    pub result_code: u32,
}

impl VerificationOutcome {
    /// The outcome every verifier reports for an accepted quote.
    pub const SUCCESS: Self = Self {
        status: VERIFICATION_SUCCESS,
        collateral_expiration_status: VERIFICATION_SUCCESS,
        result_code: VERIFICATION_SUCCESS,
    };

    /// All three fields must be success; there is no partial acceptance.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Turn a non-success outcome into [`Error::VerificationFailed`].
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::VerificationFailed(self.to_string()))
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={} collateral={} result={}",
            self.status, self.collateral_expiration_status, self.result_code
        )
    }
}

/// Decides whether an attestation quote is trustworthy.
///
/// Implementations may block; the gate always calls them from the blocking
/// thread pool. A quote that fails verification, including an empty one, must
/// be reported as [`Error::VerificationFailed`].
pub trait AttestationOracle: Send + Sync + 'static {
    fn verify(&self, quote: &[u8]) -> Result<VerificationOutcome>;
}

/// Run the oracle off the async scheduler and enforce the all-success invariant
/// on whatever it returns.
pub async fn verify_offloaded(
    oracle: Arc<dyn AttestationOracle>,
    quote: Vec<u8>,
) -> Result<VerificationOutcome> {
    if quote.is_empty() {
        return Err(Error::VerificationFailed("empty quote provided for verification".into()));
    }

    let outcome = tokio::task::spawn_blocking(move || oracle.verify(&quote))
        .await
        .map_err(|e| Error::VerificationFailed(format!("verification task failed: {e}")))??;

    outcome.ensure_success()
}
