//! RA-TLS enforcing transparent proxy.
//!
//! The proxy relays raw TCP between clients and one upstream service, but only
//! after checking that the upstream presents a TLS certificate carrying a
//! hardware attestation quote that verifies.
//!
//! ## Example Flow
//!
//! ```text
//! 1. Client connects to the proxy (plain TCP, any protocol)
//! 2. Proxy opens a probe TLS connection to the upstream and reads its certificate
//! 3. Proxy extracts the quote from extension 1.2.840.113741.1.13.1
//! 4. The attestation oracle verifies the quote
//! 5. Proxy opens a fresh TCP connection to the upstream and relays bytes
//! ```
//!
//! If the upstream does not speak TLS at all, steps 3 and 4 are skipped. Any
//! failure closes the client connection without a response.

pub mod config;
pub mod dcap;
pub mod error;
pub mod extract;
pub mod gate;
pub mod logging;
pub mod oracle;
pub mod probe;
pub mod proxy;
pub mod relay;
pub mod resolve;

pub use config::{parse_upstream, ProxyConfig};
pub use error::{Error, Result};
pub use gate::{Admission, Gate, SessionState, SessionSummary};
pub use oracle::{AttestationOracle, VerificationOutcome};
pub use proxy::{run_server, RaTlsProxy};
