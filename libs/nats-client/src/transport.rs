//! TCP connect and TLS upgrade.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use crate::config::{
    Host, ServerCertificateContext, ServerCertificateValidator, SocketOptions, TlsOptions,
};
use crate::error::{NatsError, NatsResult};

/// Duplex byte stream the connection runs over, plaintext or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Resolve `host` and connect to the first address that accepts.
pub(crate) async fn connect_tcp(host: &Host, options: &SocketOptions) -> NatsResult<TcpStream> {
    let failed = |reason: String| NatsError::FailedToConnectToHost {
        host: host.to_string(),
        reason,
    };
    let addrs = timeout(
        options.connect_timeout,
        lookup_host((host.address.as_str(), host.port)),
    )
    .await
    .map_err(|_| failed("timed out resolving address".into()))?
    .map_err(|err| failed(format!("failed to resolve address: {err}")))?;

    let mut last_err = None;
    for addr in addrs {
        trace!(%addr, "connecting");
        match timeout(options.connect_timeout, connect_addr(addr, options)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "tcp connection established");
                return Ok(stream);
            }
            Ok(Err(err)) => last_err = Some(err.to_string()),
            Err(_) => last_err = Some(format!("connect to {addr} timed out")),
        }
    }
    Err(failed(
        last_err.unwrap_or_else(|| "no addresses resolved".into()),
    ))
}

async fn connect_addr(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(size) = options.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(options.nodelay)?;
    Ok(stream)
}

/// Run the TLS handshake over an established plaintext stream.
pub(crate) async fn upgrade_tls(
    stream: TcpStream,
    host: &Host,
    options: &TlsOptions,
) -> NatsResult<TlsStream<TcpStream>> {
    let config = client_config(options)?;
    let server_name = ServerName::try_from(host.address.clone())
        .map_err(|err| NatsError::Tls(format!("invalid server name '{}': {err}", host.address)))?;
    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|err| NatsError::Tls(format!("handshake with {host} failed: {err}")))?;
    debug!(%host, "tls established");
    Ok(stream)
}

fn tls_err(err: impl fmt::Display) -> NatsError {
    NatsError::Tls(err.to_string())
}

pub(crate) fn client_config(options: &TlsOptions) -> NatsResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = CallbackVerifier::new(
        &options.root_certificates,
        provider.clone(),
        options.server_certificate_validator.clone(),
    )?;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));
    match &options.client_key {
        Some(key) if !options.client_certificates.is_empty() => builder
            .with_client_auth_cert(options.client_certificates.clone(), key.clone_key())
            .map_err(tls_err),
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Runs standard WebPKI verification, then hands the outcome to the
/// configured validator.
struct CallbackVerifier {
    /// `None` when no roots are configured; every chain is then a policy error.
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    validator: Option<ServerCertificateValidator>,
}

impl CallbackVerifier {
    fn new(
        roots: &[CertificateDer<'static>],
        provider: Arc<CryptoProvider>,
        validator: Option<ServerCertificateValidator>,
    ) -> NatsResult<Self> {
        let webpki = if roots.is_empty() {
            None
        } else {
            let mut store = RootCertStore::empty();
            for cert in roots {
                store.add(cert.clone()).map_err(tls_err)?;
            }
            Some(
                WebPkiServerVerifier::builder_with_provider(Arc::new(store), provider.clone())
                    .build()
                    .map_err(tls_err)?,
            )
        };
        Ok(Self {
            webpki,
            provider,
            validator,
        })
    }
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("has_roots", &self.webpki.is_some())
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let policy_error = match &self.webpki {
            Some(webpki) => webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .err(),
            None => Some(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )),
        };
        let accepted = match &self.validator {
            Some(validator) => {
                let name = server_name.to_str();
                validator(&ServerCertificateContext {
                    server_name: &name,
                    end_entity,
                    intermediates,
                    policy_error: policy_error.as_ref(),
                })
            }
            None => policy_error.is_none(),
        };
        if accepted {
            return Ok(ServerCertVerified::assertion());
        }
        debug!(?policy_error, "server certificate rejected");
        Err(policy_error.unwrap_or_else(|| {
            rustls::Error::General("server certificate rejected by validator".into())
        }))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
