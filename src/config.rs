//! `ServerConfig` and the options it recognizes (§3).

use std::time::Duration;

/// Which origins may connect, per the CORS policy of §4.4.
#[derive(Clone)]
pub enum CorsAllowedOrigins {
    /// Echo back whatever `Origin` header the client sent (or omit the
    /// header entirely when there was none).
    Any,
    /// Only the listed origins may connect; anything else is rejected at
    /// the handshake with `400 BAD REQUEST`.
    List(Vec<String>),
    /// A caller-supplied predicate.
    Predicate(std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Default for CorsAllowedOrigins {
    fn default() -> Self {
        Self::Any
    }
}

impl std::fmt::Debug for CorsAllowedOrigins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::List(origins) => f.debug_tuple("List").field(origins).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// The structured cookie configuration named in §6.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: String,
    pub path: String,
    pub same_site: cookie::SameSite,
    pub secure: bool,
    pub http_only: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "io".to_owned(),
            path: "/".to_owned(),
            same_site: cookie::SameSite::Lax,
            secure: false,
            http_only: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// The source protocol's `pingIntervalGracePeriod`: a small
    /// configurable grace window added to idle-timeout checks. The exact
    /// timing is left unspecified by the protocol (§9 open question); we
    /// default it to a small value and keep it configurable.
    pub ping_interval_grace: Duration,
    pub max_http_buffer_size: usize,
    pub allow_upgrades: bool,
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub cookie: Option<CookieConfig>,
    pub cors_allowed_origins: CorsAllowedOrigins,
    pub cors_credentials: bool,
    pub transports: Transports,
    pub monitor_clients: bool,
    /// Path the dispatcher is mounted under, e.g. `/engine.io/`.
    pub path: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Transports {
    pub polling: bool,
    pub websocket: bool,
}

impl Default for Transports {
    fn default() -> Self {
        Self {
            polling: true,
            websocket: true,
        }
    }
}

impl Transports {
    pub fn allows(&self, transport: &str) -> bool {
        match transport {
            "polling" => self.polling,
            "websocket" => self.websocket,
            _ => false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
            ping_interval_grace: Duration::from_millis(500),
            max_http_buffer_size: 1_000_000,
            allow_upgrades: true,
            compression_enabled: true,
            compression_threshold: 1024,
            cookie: Some(CookieConfig::default()),
            cors_allowed_origins: CorsAllowedOrigins::Any,
            cors_credentials: true,
            transports: Transports::default(),
            monitor_clients: true,
            path: "/engine.io/".to_owned(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn ping_interval(mut self, value: Duration) -> Self {
        self.config.ping_interval = value;
        self
    }

    pub fn ping_timeout(mut self, value: Duration) -> Self {
        self.config.ping_timeout = value;
        self
    }

    pub fn max_http_buffer_size(mut self, value: usize) -> Self {
        self.config.max_http_buffer_size = value;
        self
    }

    pub fn allow_upgrades(mut self, value: bool) -> Self {
        self.config.allow_upgrades = value;
        self
    }

    pub fn compression(mut self, enabled: bool, threshold: usize) -> Self {
        self.config.compression_enabled = enabled;
        self.config.compression_threshold = threshold;
        self
    }

    pub fn cookie(mut self, cookie: Option<CookieConfig>) -> Self {
        self.config.cookie = cookie;
        self
    }

    pub fn cors_allowed_origins(mut self, origins: CorsAllowedOrigins) -> Self {
        self.config.cors_allowed_origins = origins;
        self
    }

    pub fn cors_credentials(mut self, value: bool) -> Self {
        self.config.cors_credentials = value;
        self
    }

    pub fn transports(mut self, value: Transports) -> Self {
        self.config.transports = value;
        self
    }

    pub fn monitor_clients(mut self, value: bool) -> Self {
        self.config.monitor_clients = value;
        self
    }

    pub fn path(mut self, value: impl Into<String>) -> Self {
        self.config.path = value.into();
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
