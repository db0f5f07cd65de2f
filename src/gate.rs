//! Per-connection gating state machine.
//!
//! ```text
//! Accepted -> Probing -> [Extracting -> Verifying] -> OpeningUpstream -> Relaying -> Closed
//!                 \            \            \               \
//!                  +------------+------------+---------------+--> Rejected
//! ```
//!
//! A non-TLS upstream skips the bracketed states. Every error before
//! `Relaying` ends in `Rejected` without an upstream relay socket being kept.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::extract::extract_quote;
use crate::oracle::{verify_offloaded, AttestationOracle, VerificationOutcome};
use crate::probe::{ProbeResult, Prober};
use crate::relay::{relay, RelayStats};
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Probing,
    Extracting,
    Verifying,
    OpeningUpstream,
    Relaying,
    Closed,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Rejected)
    }

    /// Legal forward transitions of the gate.
    pub fn can_advance_to(self, next: Self) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, Probing)
                | (Probing, Extracting)
                | (Probing, OpeningUpstream)
                | (Extracting, Verifying)
                | (Verifying, OpeningUpstream)
                | (OpeningUpstream, Relaying)
                | (Relaying, Closed)
                | (Probing | Extracting | Verifying | OpeningUpstream, Rejected)
        ) || (next == Closed && !self.is_terminal())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Probing => "probing",
            Self::Extracting => "extracting",
            Self::Verifying => "verifying",
            Self::OpeningUpstream => "opening-upstream",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// How the upstream was admitted for relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The upstream quote verified.
    Attested(VerificationOutcome),
    /// The upstream does not speak TLS; forwarded without attestation.
    Unattested,
}

/// Report of a finished session.
#[derive(Debug)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub admission: Option<Admission>,
    pub upstream_opened: bool,
    pub relayed: Option<RelayStats>,
    pub error: Option<Error>,
    pub elapsed: Duration,
}

/// Mutable bookkeeping of one session, owned by its task.
struct Session {
    peer: SocketAddr,
    started_at: DateTime<Utc>,
    started: Instant,
    state: SessionState,
    admission: Option<Admission>,
    upstream_opened: bool,
}

impl Session {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            started_at: Utc::now(),
            started: Instant::now(),
            state: SessionState::Accepted,
            admission: None,
            upstream_opened: false,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(peer = %self.peer, "{} -> {}", self.state, next);
        self.state = next;
    }

    fn finish(mut self, outcome: Result<RelayStats>) -> SessionSummary {
        let (relayed, error) = match outcome {
            Ok(stats) => {
                self.advance(SessionState::Closed);
                (Some(stats), None)
            }
            Err(Error::Cancelled) => {
                self.advance(SessionState::Closed);
                info!(peer = %self.peer, "Connection cancelled by shutdown");
                (None, Some(Error::Cancelled))
            }
            Err(e) => {
                let phase = self.state;
                if phase == SessionState::Relaying {
                    self.advance(SessionState::Closed);
                } else {
                    self.advance(SessionState::Rejected);
                }
                if e.is_rejection() {
                    warn!(peer = %self.peer, %phase, "Connection from {} rejected: {}", self.peer, e);
                } else {
                    warn!(peer = %self.peer, %phase, "Connection from {} failed: {}", self.peer, e);
                }
                (None, Some(e))
            }
        };

        let elapsed = self.started.elapsed();
        info!(
            peer = %self.peer,
            state = %self.state,
            "Connection from {} closed after {:.2}s",
            self.peer,
            elapsed.as_secs_f64()
        );

        SessionSummary {
            peer: self.peer,
            started_at: self.started_at,
            state: self.state,
            admission: self.admission,
            upstream_opened: self.upstream_opened,
            relayed,
            error,
            elapsed,
        }
    }
}

/// Decides, per accepted client, whether the upstream may be reached and
/// relays if so. Shared read-only across sessions.
pub struct Gate {
    config: Arc<ProxyConfig>,
    prober: Prober,
    oracle: Arc<dyn AttestationOracle>,
}

impl Gate {
    pub fn new(config: Arc<ProxyConfig>, oracle: Arc<dyn AttestationOracle>) -> Result<Self> {
        config.validate()?;
        let prober = Prober::new(&config)?;
        Ok(Self {
            config,
            prober,
            oracle,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run one session to completion. Never fails: every error is resolved
    /// into the returned summary.
    pub async fn handle(
        &self,
        client: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> SessionSummary {
        let mut session = Session::new(peer);
        info!(peer = %peer, "Incoming connection from {}", peer);

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(Error::Cancelled),
            outcome = self.drive(client, &mut session) => outcome,
        };

        session.finish(outcome)
    }

    async fn drive(&self, mut client: TcpStream, session: &mut Session) -> Result<RelayStats> {
        let upstream = match self.admit(session).await {
            Ok(admission) => {
                session.admission = Some(admission);
                session.advance(SessionState::OpeningUpstream);
                self.open_upstream().await
            }
            Err(e) => Err(e),
        };

        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                close_quietly(&mut client).await;
                return Err(e);
            }
        };

        session.upstream_opened = true;
        session.advance(SessionState::Relaying);
        let stats = relay(client, upstream, self.config.buffer_size).await;
        debug!(
            peer = %session.peer,
            "Relayed {} bytes upstream, {} bytes downstream",
            stats.client_to_upstream,
            stats.upstream_to_client
        );
        Ok(stats)
    }

    /// Probe, extract and verify. Strictly sequential; the oracle runs at most
    /// once and only on a non-empty quote.
    async fn admit(&self, session: &mut Session) -> Result<Admission> {
        session.advance(SessionState::Probing);
        let cert = match self.prober.probe().await {
            ProbeResult::TlsWithCertificate(cert) => cert,
            ProbeResult::NotTls => {
                info!(
                    "Upstream {}:{} is not serving TLS; forwarding without attestation",
                    self.config.upstream_host, self.config.upstream_port
                );
                return Ok(Admission::Unattested);
            }
            ProbeResult::Failure(e) => return Err(e),
        };

        session.advance(SessionState::Extracting);
        let quote = extract_quote(&cert)?;

        session.advance(SessionState::Verifying);
        let outcome = verify_offloaded(self.oracle.clone(), quote).await?;
        debug!(peer = %session.peer, "Upstream attestation verified: {}", outcome);

        Ok(Admission::Attested(outcome))
    }

    async fn open_upstream(&self) -> Result<TcpStream> {
        let target = (self.config.upstream_target(), self.config.upstream_port);
        match timeout(self.config.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Transport(e)),
            Err(_) => Err(Error::HandshakeTimeout("upstream connect")),
        }
    }
}

/// Close a stream, swallowing errors so they never mask the primary one.
async fn close_quietly(stream: &mut TcpStream) {
    if let Err(e) = stream.shutdown().await {
        trace!("Ignoring close error: {}", e);
    }
}
