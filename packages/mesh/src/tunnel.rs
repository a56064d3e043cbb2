//! The QUIC tunnel carrying one dispatched task.
//!
//! Each connection opens exactly one bidirectional stream. TLS uses an
//! ephemeral in-memory self-signed certificate: the goal is transport
//! confidentiality on a trusted network, not mutual authentication, so the
//! client side skips certificate verification.
//!
//! A tunnel lives for the duration of one dispatched task plus ping/pong
//! keep-alive. Batched message kinds (file access, output) accumulate in
//! the writer until the payload crosses [`BATCH_LIMIT`] or the tunnel is
//! flushed.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use jiff::Timestamp;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tracing::{debug, instrument, trace, warn};

use crate::{
    compress::Codec,
    message::{self, BATCH_LIMIT, FileAccess, Message, OutputLine},
};

/// Default per-operation timeout (handshake, read deadline).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default retry budget for timed-out operations.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// TLS server name presented by every worker; never verified, but the
/// handshake requires both sides to agree on something.
const SERVER_NAME: &str = "anvil";

/// Tunnel behavior knobs shared by both ends.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub codec: Codec,
    pub timeout: Duration,
    pub retry_count: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            timeout: DEFAULT_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

/// Build a server endpoint with a freshly generated self-signed identity.
#[instrument]
pub fn server_endpoint(bind: SocketAddr) -> Result<quinn::Endpoint> {
    let identity = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .context("generate self-signed certificate")?;
    let cert: CertificateDer<'static> = identity.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(identity.signing_key.serialize_der());
    let server_config = quinn::ServerConfig::with_single_cert(vec![cert], key.into())
        .context("build server tls config")?;
    quinn::Endpoint::server(server_config, bind).context("bind server endpoint")
}

/// Build a client endpoint that accepts any server certificate.
#[instrument]
pub fn client_endpoint() -> Result<quinn::Endpoint> {
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .context("build quic client config")?;
    let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
        .context("bind client endpoint")?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));
    Ok(endpoint)
}

/// Accepts the peer's certificate without verification.
///
/// Signature checks still run against the presented key so a garbled
/// handshake fails; only the trust decision is skipped.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// One end of a per-task message stream.
pub struct Tunnel {
    connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    config: TunnelConfig,
    ping_estimate: Option<Duration>,
    last_write: Instant,
    /// The batched message currently accumulating, if any.
    pending: Option<Message>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("remote", &self.connection.remote_address())
            .field("ping", &self.ping_estimate)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Dial a worker and open the task stream.
    #[instrument(skip(config))]
    pub async fn connect(
        endpoint: &quinn::Endpoint,
        addr: SocketAddr,
        config: TunnelConfig,
    ) -> Result<Self> {
        let connecting = endpoint
            .connect(addr, SERVER_NAME)
            .context("start connection")?;
        let connection = tokio::time::timeout(config.timeout, connecting)
            .await
            .map_err(|_| timeout_error("tunnel handshake"))?
            .context("complete connection")?;
        let (send, recv) = tokio::time::timeout(config.timeout, connection.open_bi())
            .await
            .map_err(|_| timeout_error("open stream"))?
            .context("open bidirectional stream")?;
        debug!(%addr, "tunnel connected");
        Ok(Self::from_parts(connection, send, recv, config))
    }

    /// Accept the next inbound tunnel on a worker endpoint.
    #[instrument(skip_all)]
    pub async fn accept(endpoint: &quinn::Endpoint, config: TunnelConfig) -> Result<Self> {
        let incoming = match endpoint.accept().await {
            Some(incoming) => incoming,
            None => bail!("endpoint closed"),
        };
        let connection = incoming.await.context("accept connection")?;
        let (send, recv) = tokio::time::timeout(config.timeout, connection.accept_bi())
            .await
            .map_err(|_| timeout_error("accept stream"))?
            .context("accept bidirectional stream")?;
        debug!(remote = %connection.remote_address(), "tunnel accepted");
        Ok(Self::from_parts(connection, send, recv, config))
    }

    fn from_parts(
        connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        config: TunnelConfig,
    ) -> Self {
        Self {
            connection,
            send,
            recv,
            config,
            ping_estimate: None,
            last_write: Instant::now(),
            pending: None,
        }
    }

    /// Remote address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Instantaneous latency estimate from the most recent pong.
    pub fn ping_estimate(&self) -> Option<Duration> {
        self.ping_estimate
    }

    /// How long since the last write on this tunnel.
    pub fn idle_for(&self) -> Duration {
        self.last_write.elapsed()
    }

    /// Send a message immediately, flushing any accumulated batch first so
    /// cross-batch order equals send order.
    #[instrument(skip_all, fields(kind = %message.kind()))]
    pub async fn send(&mut self, mut message: Message) -> Result<()> {
        self.flush().await?;
        self.write(&mut message).await
    }

    /// Queue a file-access record into the current batch.
    pub async fn push_file_access(&mut self, record: FileAccess) -> Result<()> {
        match &mut self.pending {
            Some(Message::FileAccess { records }) => records.push(record),
            _ => {
                self.flush().await?;
                self.pending = Some(Message::FileAccess {
                    records: vec![record],
                });
            }
        }
        self.flush_if_full().await
    }

    /// Queue an output line into the current batch.
    pub async fn push_output(&mut self, line: OutputLine) -> Result<()> {
        match &mut self.pending {
            Some(Message::Output { lines }) => lines.push(line),
            _ => {
                self.flush().await?;
                self.pending = Some(Message::Output { lines: vec![line] });
            }
        }
        self.flush_if_full().await
    }

    async fn flush_if_full(&mut self) -> Result<()> {
        let full = self
            .pending
            .as_mut()
            .is_some_and(|pending| pending.payload_len() >= BATCH_LIMIT);
        if full { self.flush().await } else { Ok(()) }
    }

    /// Write out any accumulated batch.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(mut pending) = self.pending.take() {
            self.write(&mut pending).await?;
        }
        Ok(())
    }

    async fn write(&mut self, message: &mut Message) -> Result<()> {
        let written = message::write_frame(&mut self.send, message, &self.config.codec).await?;
        self.last_write = Instant::now();
        trace!(kind = %message.kind(), bytes = written, "sent frame");
        Ok(())
    }

    /// Read one frame with the configured deadline. Timeouts surface as an
    /// error recognizable by [`is_timeout`].
    pub async fn recv(&mut self) -> Result<Message> {
        let frame = tokio::time::timeout(
            self.config.timeout,
            message::read_frame(&mut self.recv, &self.config.codec),
        )
        .await
        .map_err(|_| timeout_error("tunnel read"))??;
        trace!(kind = %frame.kind(), "received frame");
        Ok(frame)
    }

    /// Read the next application message.
    ///
    /// Keep-alive traffic is handled here: inbound pings are answered with
    /// a pong, inbound pongs update the latency estimate. Read timeouts
    /// are retried up to the budget; on each idle tick a ping goes out if
    /// nothing has been written for half the timeout.
    #[instrument(skip_all)]
    pub async fn next_message(&mut self) -> Result<Message> {
        let mut attempts = 0;
        loop {
            match self.recv().await {
                Ok(Message::Ping { timestamp }) => {
                    self.send(Message::Pong { timestamp }).await?;
                }
                Ok(Message::Pong { timestamp }) => {
                    let now = Timestamp::now();
                    let elapsed = now.since(timestamp).ok().and_then(|span| {
                        span.total(jiff::Unit::Second)
                            .ok()
                            .filter(|seconds| *seconds >= 0.0)
                            .map(Duration::from_secs_f64)
                    });
                    if let Some(elapsed) = elapsed {
                        self.ping_estimate = Some(elapsed);
                        trace!(?elapsed, "updated ping estimate");
                    }
                }
                Ok(message) => return Ok(message),
                Err(err) if is_timeout(&err) => {
                    attempts += 1;
                    if attempts > self.config.retry_count {
                        return Err(err.wrap_err("tunnel read retries exhausted"));
                    }
                    if self.idle_for() > self.config.timeout / 2 {
                        self.send(Message::Ping {
                            timestamp: Timestamp::now(),
                        })
                        .await?;
                    }
                    warn!(attempts, "tunnel read timed out, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the tunnel after an orderly goodbye.
    #[instrument(skip_all)]
    pub async fn goodbye(mut self) -> Result<()> {
        self.send(Message::Goodbye).await?;
        self.send.finish().ok();
        self.connection.close(0u32.into(), b"goodbye");
        Ok(())
    }
}

/// Construct the error used for expired deadlines.
fn timeout_error(operation: &str) -> Report {
    Report::new(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{operation} timed out"),
    ))
}

/// Whether an error chain bottoms out in an expired deadline.
pub fn is_timeout(err: &Report) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::message::RemoteError;

    use super::*;

    fn localhost_pair() -> Result<(quinn::Endpoint, quinn::Endpoint, SocketAddr)> {
        let server = server_endpoint(SocketAddr::from(([127, 0, 0, 1], 0)))?;
        let addr = server.local_addr().context("server addr")?;
        let client = client_endpoint()?;
        Ok((server, client, addr))
    }

    #[test_log::test(tokio::test)]
    async fn dispatch_round_trip_over_loopback() -> Result<()> {
        let (server, client, addr) = localhost_pair()?;

        let worker = tokio::spawn(async move {
            let mut tunnel = Tunnel::accept(&server, TunnelConfig::default()).await?;
            let message = tunnel.next_message().await?;
            assert!(matches!(message, Message::Dispatch(_)));
            tunnel
                .send(Message::Start {
                    code: RemoteError::NoError,
                })
                .await?;
            tunnel
                .send(Message::Stop {
                    exit_code: 0,
                    code: RemoteError::NoError,
                })
                .await?;
            tunnel.flush().await?;
            Ok::<_, Report>(())
        });

        let mut tunnel = Tunnel::connect(&client, addr, TunnelConfig::default()).await?;
        tunnel
            .send(Message::Dispatch(crate::message::TaskDispatch {
                executable: "/bin/true".into(),
                ..Default::default()
            }))
            .await?;
        let start = tunnel.next_message().await?;
        assert_eq!(
            start,
            Message::Start {
                code: RemoteError::NoError
            }
        );
        let stop = tunnel.next_message().await?;
        assert_eq!(
            stop,
            Message::Stop {
                exit_code: 0,
                code: RemoteError::NoError
            }
        );

        worker.await.context("join worker")??;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn batched_records_flush_in_order() -> Result<()> {
        let (server, client, addr) = localhost_pair()?;

        let worker = tokio::spawn(async move {
            let mut tunnel = Tunnel::accept(&server, TunnelConfig::default()).await?;
            for index in 0u32..8 {
                tunnel
                    .push_file_access(FileAccess {
                        path: format!("/src/file-{index}.c").into(),
                        write: false,
                    })
                    .await?;
            }
            tunnel
                .push_output(OutputLine {
                    stderr: false,
                    line: "done".into(),
                })
                .await?;
            tunnel.flush().await?;
            Ok::<_, Report>(())
        });

        let mut tunnel = Tunnel::connect(&client, addr, TunnelConfig::default()).await?;
        let accesses = tunnel.next_message().await?;
        let Message::FileAccess { records } = accesses else {
            bail!("expected file access batch, got {}", accesses.kind());
        };
        let paths = records
            .iter()
            .map(|record| record.path.display().to_string())
            .collect::<Vec<_>>();
        assert_eq!(paths[0], "/src/file-0.c");
        assert_eq!(paths.len(), 8, "one batch preserves intra-batch order");

        let output = tunnel.next_message().await?;
        assert!(matches!(output, Message::Output { .. }));

        worker.await.context("join worker")??;
        Ok(())
    }

    #[test]
    fn timeout_errors_are_recognizable() {
        let err = timeout_error("test");
        assert!(is_timeout(&err));
        let other = Report::msg("some other failure");
        assert!(!is_timeout(&other));
    }
}
