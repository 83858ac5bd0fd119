//! Client configuration.
//!
//! [`ConnectionInfo`] is a plain owned value. The client clones it on
//! construction, so later changes to the caller's copy never reach a running
//! client.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use nats_wire::subject::validate_token;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{NatsError, NatsResult};

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_CLIENT_NAME: &str = "nats-client";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Reserved subject prefix for reply inboxes.
pub const INBOX_PREFIX: &str = "_INBOX";

/// User/password pair sent in `CONNECT`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// One candidate broker. Host-level credentials override client-level ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl Host {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Parses `[nats://][user[:pass]@]host[:port]`. IPv6 literals go in brackets.
impl FromStr for Host {
    type Err = NatsError;

    fn from_str(s: &str) -> NatsResult<Self> {
        let url = s.trim();
        let rest = match url.split_once("://") {
            Some((scheme, rest))
                if scheme.eq_ignore_ascii_case("nats") || scheme.eq_ignore_ascii_case("tls") =>
            {
                rest
            }
            Some((scheme, _)) => {
                return Err(NatsError::InvalidConfig(format!(
                    "unsupported scheme '{scheme}' in '{url}'"
                )));
            }
            None => url,
        };
        let rest = rest.trim_end_matches('/');
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, rest),
        };
        let (address, port) = parse_host_port(hostport)?;
        if address.is_empty() {
            return Err(NatsError::InvalidConfig(format!("missing host in '{url}'")));
        }
        Ok(Self {
            address,
            port,
            credentials: userinfo.map(|userinfo| match userinfo.split_once(':') {
                Some((user, pass)) => Credentials::new(user, pass),
                None => Credentials::new(userinfo, ""),
            }),
        })
    }
}

fn parse_host_port(s: &str) -> NatsResult<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (address, tail) = rest
            .split_once(']')
            .ok_or_else(|| NatsError::InvalidConfig(format!("unterminated IPv6 literal '{s}'")))?;
        let port = match tail {
            "" => DEFAULT_PORT,
            tail => match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None => {
                    return Err(NatsError::InvalidConfig(format!(
                        "unexpected '{tail}' after IPv6 literal"
                    )));
                }
            },
        };
        return Ok((address.to_string(), port));
    }
    match s.rsplit_once(':') {
        // bare IPv6 without brackets
        Some((address, _)) if address.contains(':') => Ok((s.to_string(), DEFAULT_PORT)),
        Some((address, port)) => Ok((address.to_string(), parse_port(port)?)),
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(port: &str) -> NatsResult<u16> {
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(NatsError::InvalidConfig(format!("invalid port '{port}'"))),
    }
}

/// Socket and liveness tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Bound on DNS resolution, TCP connect and each handshake read.
    pub connect_timeout: Duration,
    pub receive_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
    pub nodelay: bool,
    /// How long the reader waits for data before running a liveness check.
    pub receive_timeout: Duration,
    /// Silence after which an unsolicited `PING` is sent.
    pub ping_after_silence: Duration,
    /// Silence after which the connection is declared dead.
    pub max_silence: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_buffer_size: None,
            send_buffer_size: None,
            nodelay: true,
            receive_timeout: Duration::from_secs(5),
            ping_after_silence: Duration::from_secs(10),
            max_silence: Duration::from_secs(30),
        }
    }
}

/// What a [`ServerCertificateValidator`] gets to look at.
pub struct ServerCertificateContext<'a> {
    pub server_name: &'a str,
    pub end_entity: &'a CertificateDer<'a>,
    pub intermediates: &'a [CertificateDer<'a>],
    /// Result of standard WebPKI verification against the configured roots;
    /// `None` means the chain verified cleanly.
    pub policy_error: Option<&'a rustls::Error>,
}

/// Decides whether a server certificate is accepted. Without one, a
/// certificate is accepted only when `policy_error` is `None`.
pub type ServerCertificateValidator =
    Arc<dyn Fn(&ServerCertificateContext<'_>) -> bool + Send + Sync>;

#[derive(Default)]
pub struct TlsOptions {
    pub root_certificates: Vec<CertificateDer<'static>>,
    pub client_certificates: Vec<CertificateDer<'static>>,
    pub client_key: Option<PrivateKeyDer<'static>>,
    pub server_certificate_validator: Option<ServerCertificateValidator>,
}

impl TlsOptions {
    /// Load roots and an optional client identity from PEM files.
    pub fn from_pem_files(
        ca: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> NatsResult<Self> {
        let mut options = TlsOptions::default();
        if let Some(ca) = ca {
            options.root_certificates = read_certs(ca)?;
        }
        if let Some(cert) = cert {
            options.client_certificates = read_certs(cert)?;
        }
        if let Some(key) = key {
            options.client_key = Some(PrivateKeyDer::from_pem_file(key).map_err(|err| {
                NatsError::InvalidConfig(format!(
                    "failed to read private key '{}': {err}",
                    key.display()
                ))
            })?);
        }
        Ok(options)
    }

    pub fn has_client_certificates(&self) -> bool {
        !self.client_certificates.is_empty() && self.client_key.is_some()
    }
}

fn read_certs(path: &Path) -> NatsResult<Vec<CertificateDer<'static>>> {
    let invalid = |err: rustls_pki_types::pem::Error| {
        NatsError::InvalidConfig(format!(
            "failed to read certificates '{}': {err}",
            path.display()
        ))
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(invalid)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid)?;
    if certs.is_empty() {
        return Err(NatsError::InvalidConfig(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

impl Clone for TlsOptions {
    fn clone(&self) -> Self {
        Self {
            root_certificates: self.root_certificates.clone(),
            client_certificates: self.client_certificates.clone(),
            client_key: self.client_key.as_ref().map(PrivateKeyDer::clone_key),
            server_certificate_validator: self.server_certificate_validator.clone(),
        }
    }
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("root_certificates", &self.root_certificates.len())
            .field("client_certificates", &self.client_certificates.len())
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .field(
                "server_certificate_validator",
                &self.server_certificate_validator.is_some(),
            )
            .finish()
    }
}

/// Auto-reconnect attempts with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PubFlushMode {
    /// Flush after every publish.
    #[default]
    Auto,
    /// Leave flushing to the caller.
    Manual,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub hosts: Vec<Host>,
    /// Client name sent in `CONNECT`.
    pub name: String,
    /// Used for hosts that carry no credentials of their own.
    pub credentials: Option<Credentials>,
    pub verbose: bool,
    pub auto_respond_to_ping: bool,
    pub auto_reconnect_on_failure: bool,
    pub pub_flush_mode: PubFlushMode,
    pub request_timeout: Duration,
    /// Multiplex requests over one shared inbox subscription instead of one
    /// temporary subscription per request.
    pub use_inbox_requests: bool,
    /// Announce header support (HPUB/HMSG and no-responder replies).
    pub headers: bool,
    pub socket: SocketOptions,
    pub tls: TlsOptions,
    pub reconnect: ReconnectPolicy,
    /// Buffered messages per subscription before deliveries are dropped.
    pub subscription_capacity: usize,
    /// Buffered items per consumer of the op and event streams.
    pub broadcast_capacity: usize,
}

impl ConnectionInfo {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            hosts,
            name: DEFAULT_CLIENT_NAME.to_string(),
            credentials: None,
            verbose: false,
            auto_respond_to_ping: true,
            auto_reconnect_on_failure: false,
            pub_flush_mode: PubFlushMode::Auto,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            use_inbox_requests: true,
            headers: true,
            socket: SocketOptions::default(),
            tls: TlsOptions::default(),
            reconnect: ReconnectPolicy::default(),
            subscription_capacity: 1024,
            broadcast_capacity: 1024,
        }
    }

    /// Build from a comma separated list of URLs.
    pub fn from_urls(urls: &str) -> NatsResult<Self> {
        let hosts = urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::parse)
            .collect::<NatsResult<Vec<Host>>>()?;
        Ok(Self::new(hosts))
    }

    pub fn validate(&self) -> NatsResult<()> {
        if self.hosts.is_empty() {
            return Err(NatsError::InvalidConfig("at least one host is required".into()));
        }
        for host in &self.hosts {
            if host.address.is_empty() || host.port == 0 {
                return Err(NatsError::InvalidConfig(format!("invalid host '{host}'")));
            }
        }
        validate_token("client name", &self.name)
            .map_err(|err| NatsError::InvalidConfig(err.to_string()))?;
        if self.request_timeout.is_zero() {
            return Err(NatsError::InvalidConfig("request_timeout must be non-zero".into()));
        }
        if self.socket.receive_timeout.is_zero() {
            return Err(NatsError::InvalidConfig("receive_timeout must be non-zero".into()));
        }
        if self.socket.ping_after_silence >= self.socket.max_silence {
            return Err(NatsError::InvalidConfig(format!(
                "ping_after_silence ({:?}) must be shorter than max_silence ({:?})",
                self.socket.ping_after_silence, self.socket.max_silence
            )));
        }
        if self.subscription_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(NatsError::InvalidConfig("channel capacities must be non-zero".into()));
        }
        if self.tls.client_certificates.is_empty() != self.tls.client_key.is_none() {
            return Err(NatsError::InvalidConfig(
                "client certificates and client key must be configured together".into(),
            ));
        }
        Ok(())
    }
}
