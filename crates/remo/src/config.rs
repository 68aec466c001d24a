//! Typed configuration for both ends of a connection.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use remowire::FrameLimits;

/// Receives one human-readable line per message sent or received.
pub type Transcript = Arc<dyn Fn(&str) + Send + Sync>;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Access point settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Application name clients must present to be granted access.
    pub identity: String,
    pub bind: IpAddr,
    /// Port used by `AccessPoint::enable_default`. `0` lets the OS choose.
    pub port: u16,
    /// Delay before a contended send is retried.
    pub retry_delay: Duration,
    pub limits: FrameLimits,
    pub transcript: Option<Transcript>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            limits: FrameLimits::default(),
            transcript: None,
        }
    }
}

impl ServerConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), ..Self::default() }
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("identity", &self.identity)
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("retry_delay", &self.retry_delay)
            .field("limits", &self.limits)
            .field("transcript", &self.transcript.is_some())
            .finish()
    }
}

/// Remote access point settings.
#[derive(Clone)]
pub struct ClientConfig {
    /// Application name presented in `RequestAccess`.
    pub identity: String,
    /// How long to wait for the access handshake before reporting failure.
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub limits: FrameLimits,
    pub transcript: Option<Transcript>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            limits: FrameLimits::default(),
            transcript: None,
        }
    }
}

impl ClientConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), ..Self::default() }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("identity", &self.identity)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("limits", &self.limits)
            .field("transcript", &self.transcript.is_some())
            .finish()
    }
}
