//! Server `INFO` and client `CONNECT` payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};

/// Max payload assumed when a server does not advertise one.
pub const DEFAULT_MAX_PAYLOAD: u64 = 1024 * 1024;

/// Structured view of the JSON carried by an `INFO` op.
///
/// Unknown fields are ignored and missing ones take their defaults, so
/// older and newer servers both parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub go: String,
    pub host: String,
    pub port: u16,
    pub proto: i32,
    /// Server understands HPUB/HMSG.
    pub headers: bool,
    pub auth_required: bool,
    pub tls_required: bool,
    /// Server requires a client certificate.
    pub tls_verify: bool,
    pub tls_available: bool,
    /// Hard upper bound on any single outbound message body.
    pub max_payload: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connect_urls: Vec<String>,
    /// Lame duck mode: the server is about to shut down.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ldm: bool,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            server_name: String::new(),
            version: String::new(),
            go: String::new(),
            host: String::new(),
            port: 0,
            proto: 0,
            headers: false,
            auth_required: false,
            tls_required: false,
            tls_verify: false,
            tls_available: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
            client_id: None,
            connect_urls: Vec::new(),
            ldm: false,
        }
    }
}

impl ServerInfo {
    /// Parse the JSON text of an `INFO` op.
    pub fn parse(json: &str) -> WireResult<Self> {
        serde_json::from_str(json).map_err(WireError::InvalidInfo)
    }

    /// Serialize back to the JSON form carried by `INFO`.
    pub fn to_json(&self) -> WireResult<String> {
        serde_json::to_string(self).map_err(WireError::InvalidInfo)
    }
}

/// Body of the `CONNECT` command.
///
/// Field order is the order they appear on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub name: String,
    pub lang: String,
    pub protocol: u8,
    pub pedantic: bool,
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub headers: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_responders: bool,
}

impl Connect {
    /// A `CONNECT` body for a rust client with the given name.
    pub fn new(name: impl Into<String>, verbose: bool) -> Self {
        Self {
            name: name.into(),
            lang: "rust".into(),
            protocol: 1,
            pedantic: false,
            verbose,
            user: None,
            pass: None,
            headers: false,
            no_responders: false,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Announce header support, which also enables no-responder replies.
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.headers = enabled;
        self.no_responders = enabled;
        self
    }
}

impl fmt::Debug for Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect")
            .field("name", &self.name)
            .field("lang", &self.lang)
            .field("protocol", &self.protocol)
            .field("verbose", &self.verbose)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
