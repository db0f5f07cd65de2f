//! Upstream TLS probing.
//!
//! A probe is a throwaway TLS connection used only to read the upstream's leaf
//! certificate. It never carries client data.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, InvalidMessage, SignatureScheme};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Markers in a handshake error that indicate the peer answered the
/// ClientHello with something other than TLS.
const NON_TLS_MARKERS: [&str; 2] = ["wrong version number", "unknown protocol"];

/// Classification of the upstream after a probe.
#[derive(Debug)]
pub enum ProbeResult {
    /// Handshake completed; carries the leaf certificate in DER form.
    TlsWithCertificate(Vec<u8>),
    /// The port is open but the peer does not speak TLS.
    NotTls,
    Failure(Error),
}

/// Accepts any server certificate while still checking handshake signatures.
///
/// Chain and hostname validation are skipped on purpose: trust comes from the
/// attestation quote inside the certificate, not from a CA.
#[derive(Debug)]
struct AttestationOnlyVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AttestationOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Opens probe connections to the configured upstream.
#[derive(Clone)]
pub struct Prober {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    target: String,
    port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    deadline: Duration,
}

impl Prober {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let server_name = ServerName::try_from(config.upstream_host.clone()).map_err(|e| {
            Error::Configuration(format!(
                "invalid upstream server name '{}': {e}",
                config.upstream_host
            ))
        })?;

        let provider = Arc::new(aws_lc_rs::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Configuration(format!("TLS client config: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AttestationOnlyVerifier { provider }))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            target: config.upstream_target().to_string(),
            port: config.upstream_port,
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            deadline: config.probe_deadline(),
        })
    }

    /// Connect, handshake, capture the leaf certificate, close.
    pub async fn probe(&self) -> ProbeResult {
        match timeout(self.deadline, self.handshake()).await {
            Ok(result) => result,
            Err(_) => ProbeResult::Failure(Error::HandshakeTimeout("TLS handshake")),
        }
    }

    async fn handshake(&self) -> ProbeResult {
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.target.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return ProbeResult::Failure(Error::Transport(e)),
            Err(_) => return ProbeResult::Failure(Error::HandshakeTimeout("upstream connect")),
        };

        let handshake = self.connector.connect(self.server_name.clone(), stream);
        let mut tls_stream = match timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) if is_non_tls_error(&e) => {
                debug!("Detected non-TLS upstream during handshake: {}", e);
                return ProbeResult::NotTls;
            }
            Ok(Err(e)) => {
                return ProbeResult::Failure(Error::QuoteMissing(format!(
                    "failed to obtain upstream certificate: {e}"
                )))
            }
            Err(_) => return ProbeResult::Failure(Error::HandshakeTimeout("TLS handshake")),
        };

        let (_, connection) = tls_stream.get_ref();
        let leaf = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        // The probe is never reused; close it before reporting.
        if let Ok(Err(e)) = timeout(self.handshake_timeout, tls_stream.shutdown()).await {
            trace!("Ignoring probe close error: {}", e);
        }

        match leaf {
            Some(cert) if !cert.is_empty() => ProbeResult::TlsWithCertificate(cert),
            _ => ProbeResult::Failure(Error::QuoteMissing("upstream certificate missing".into())),
        }
    }
}

/// Best-effort detection of a peer that answered the ClientHello with non-TLS
/// bytes.
///
/// rustls rejects such replies at the record layer with an unknown content type
/// or protocol version. The textual markers cover the OpenSSL wording of the
/// same condition.
pub fn is_non_tls_error(error: &io::Error) -> bool {
    let tls_error = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    if let Some(rustls::Error::InvalidMessage(
        InvalidMessage::InvalidContentType | InvalidMessage::UnknownProtocolVersion,
    )) = tls_error
    {
        return true;
    }

    let rendered = error.to_string().to_lowercase().replace('_', " ");
    NON_TLS_MARKERS
        .iter()
        .any(|marker| rendered.contains(marker))
}
