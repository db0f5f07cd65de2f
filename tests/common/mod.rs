//! Shared fixtures: RA-TLS upstreams, counting oracle, proxy helpers.

#![allow(dead_code)]

use ra_tls_proxy::{AttestationOracle, Error, Gate, ProxyConfig, RaTlsProxy, Result, VerificationOutcome};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub const QUOTE_OID: &[u64] = &[1, 2, 840, 113741, 1, 13, 1];
pub const UPSTREAM_SERVER_NAME: &str = "enclave.test";

const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Build a TLS acceptor whose self-signed certificate optionally carries a quote.
pub fn ra_tls_acceptor(quote: Option<&[u8]>) -> TlsAcceptor {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![UPSTREAM_SERVER_NAME.to_string()]).unwrap();
    if let Some(quote) = quote {
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(QUOTE_OID, quote.to_vec()));
    }
    let cert = params.self_signed(&key_pair).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();

    TlsAcceptor::from(Arc::new(config))
}

#[derive(Clone)]
pub enum Behaviour {
    /// TLS to probes, plain echo (`ping` answered with `pong`) to everything else.
    RaTls(TlsAcceptor),
    /// Answers a ClientHello with an HTTP error, plain echo otherwise.
    NotTls,
    /// Like `NotTls`, but a relayed connection is held open, idle, after the
    /// proxy stops sending.
    NotTlsHolding,
    /// Accepts and reads, never answers.
    Silent,
}

#[derive(Default)]
pub struct Counters {
    pub accepted: AtomicUsize,
    pub tls: AtomicUsize,
    pub plain: AtomicUsize,
}

pub struct Upstream {
    pub addr: SocketAddr,
    pub counters: Arc<Counters>,
}

impl Upstream {
    pub fn accepted(&self) -> usize {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.counters.tls.load(Ordering::SeqCst)
    }

    pub fn relays(&self) -> usize {
        self.counters.plain.load(Ordering::SeqCst)
    }
}

pub async fn spawn_upstream(behaviour: Behaviour) -> Upstream {
    spawn_upstream_accepting(behaviour, usize::MAX).await
}

/// An upstream that stops listening after its first connection, so only the
/// probe gets through and the relay connect is refused.
pub async fn spawn_single_use_upstream(behaviour: Behaviour) -> Upstream {
    spawn_upstream_accepting(behaviour, 1).await
}

async fn spawn_upstream_accepting(behaviour: Behaviour, limit: usize) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counters = Arc::new(Counters::default());

    tokio::spawn({
        let counters = counters.clone();
        async move {
            for _ in 0..limit {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                counters.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_upstream(stream, behaviour.clone(), counters.clone()));
            }
        }
    });

    Upstream { addr, counters }
}

async fn serve_upstream(mut stream: TcpStream, behaviour: Behaviour, counters: Arc<Counters>) {
    if let Behaviour::Silent = behaviour {
        drain(&mut stream).await;
        return;
    }

    let mut first = [0u8; 1];
    if !matches!(stream.peek(&mut first).await, Ok(1)) {
        return;
    }
    if first[0] != TLS_HANDSHAKE_RECORD {
        counters.plain.fetch_add(1, Ordering::SeqCst);
        echo(&mut stream).await;
        if let Behaviour::NotTlsHolding = behaviour {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        return;
    }

    counters.tls.fetch_add(1, Ordering::SeqCst);
    match behaviour {
        Behaviour::RaTls(acceptor) => {
            if let Ok(mut tls) = acceptor.accept(stream).await {
                let mut sink = Vec::new();
                let _ = tls.read_to_end(&mut sink).await;
            }
        }
        Behaviour::NotTls | Behaviour::NotTlsHolding => {
            let mut hello = vec![0u8; 16 * 1024];
            let _ = stream.read(&mut hello).await;
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            let _ = stream.shutdown().await;
            drain(&mut stream).await;
        }
        Behaviour::Silent => {}
    }
}

async fn echo(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let reply: &[u8] = if &buf[..n] == b"ping" { b"pong" } else { &buf[..n] };
        if stream.write_all(reply).await.is_err() {
            break;
        }
    }
}

async fn drain(stream: &mut TcpStream) {
    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink).await;
}

/// Accepts exactly one quote and counts every invocation.
pub struct CountingOracle {
    accepted_quote: Vec<u8>,
    calls: AtomicUsize,
}

impl CountingOracle {
    pub fn accepting(quote: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            accepted_quote: quote.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AttestationOracle for CountingOracle {
    fn verify(&self, quote: &[u8]) -> Result<VerificationOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if quote == self.accepted_quote.as_slice() {
            Ok(VerificationOutcome::SUCCESS)
        } else {
            Err(Error::VerificationFailed(
                "status=0 collateral=0 result=40967".into(),
            ))
        }
    }
}

/// Proxy config pointing at `upstream`, with the TLS name decoupled from the
/// socket target.
pub fn proxy_config(upstream: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        upstream_host: UPSTREAM_SERVER_NAME.into(),
        upstream_port: upstream.port(),
        upstream_connect_host: Some(upstream.ip().to_string()),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(3),
        buffer_size: 4096,
    }
}

pub fn gate(config: ProxyConfig, oracle: Arc<dyn AttestationOracle>) -> Arc<Gate> {
    Arc::new(Gate::new(Arc::new(config), oracle).unwrap())
}

/// A connected client socket plus the proxy-side end handed to the gate.
pub async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (accepted, peer) = listener.accept().await.unwrap();
    (client, accepted, peer)
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

pub async fn start_proxy(config: ProxyConfig, oracle: Arc<dyn AttestationOracle>) -> RunningProxy {
    let proxy = RaTlsProxy::new(config, oracle).unwrap();
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { proxy.serve(listener, shutdown).await }
    });

    RunningProxy {
        addr,
        shutdown,
        task,
    }
}

/// Send `ping`, expect `pong`.
pub async fn ping_pong(client: &mut TcpStream) {
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("no reply through proxy")
        .unwrap();
    assert_eq!(&reply, b"pong");
}

/// Wait for the peer to close the connection. Resets count as closure.
pub async fn expect_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(10), client.read(&mut buf))
        .await
        .expect("connection was not closed");
    if let Ok(n) = read {
        assert_eq!(n, 0, "unexpected data from a closed connection");
    }
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
