//! Configuration types for Hearth

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::handler::{Handler, MuxFactory, ServiceErrorHandler};
use crate::{EngineError, Result};

/// Default deadline for the full request head to arrive
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for the whole request-to-response span
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for an idle keep-alive connection
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default request line limit in bytes
pub const DEFAULT_MAX_REQUEST_LINE_LEN: usize = 8 * 1024;
/// Default header block limit in bytes
pub const DEFAULT_MAX_HEADERS_LEN: usize = 64 * 1024;
/// Default bound on buffered body bytes per connection
pub const DEFAULT_CHUNK_BUFFER_MAX_SIZE: usize = 64 * 1024;
/// Default maximum concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;
/// Default timer wheel granularity
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
/// Default graceful shutdown drain timeout
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS material for the engine
#[derive(Clone)]
pub enum TlsOptions {
    /// Certificate chain and private key loaded from PEM files
    Pem {
        /// Path to the PEM certificate chain
        cert: PathBuf,
        /// Path to the PEM private key
        key: PathBuf,
    },
    /// Externally built rustls server configuration
    ///
    /// The caller owns the ALPN offer list on this path; negotiating a
    /// protocol the engine was not configured for fails the connection.
    Preconfigured(Arc<rustls::ServerConfig>),
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsOptions::Pem { cert, key } => f
                .debug_struct("Pem")
                .field("cert", cert)
                .field("key", key)
                .finish(),
            TlsOptions::Preconfigured(_) => f.write_str("Preconfigured(..)"),
        }
    }
}

/// Immutable configuration snapshot for a server engine
///
/// Each `with_*` constructor consumes the snapshot and yields a new one;
/// no shared mutable builder state exists.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Socket address to bind
    pub bind_addr: SocketAddr,
    /// Deadline for the full request head to arrive
    pub response_header_timeout: Duration,
    /// Deadline for the whole request-to-response span
    pub request_timeout: Duration,
    /// Deadline for an idle keep-alive connection
    pub idle_timeout: Duration,
    /// Request line limit in bytes
    pub max_request_line_len: usize,
    /// Header block limit in bytes
    pub max_headers_len: usize,
    /// Bound on buffered body bytes per connection
    pub chunk_buffer_max_size: usize,
    /// Maximum concurrent connections; 0 refuses every connection
    pub max_connections: usize,
    /// Whether the multiplexed protocol may be negotiated (requires TLS)
    pub multiplexing: bool,
    /// TLS material, if the engine terminates TLS
    pub tls: Option<TlsOptions>,
    /// Lines logged at startup
    pub banner: Vec<String>,
    /// Timer wheel granularity
    pub tick: Duration,
    /// Graceful shutdown drain timeout
    pub shutdown_timeout: Duration,
    /// Application handler
    pub handler: Handler,
    /// Failure-to-response mapping for handler faults
    pub error_handler: ServiceErrorHandler,
    /// Driver for multiplexed connections
    pub mux_factory: Option<MuxFactory>,
}

impl ServerOptions {
    /// Create options with defaults and the given application handler
    #[must_use]
    pub fn new(handler: Handler) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            response_header_timeout: DEFAULT_RESPONSE_HEADER_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_request_line_len: DEFAULT_MAX_REQUEST_LINE_LEN,
            max_headers_len: DEFAULT_MAX_HEADERS_LEN,
            chunk_buffer_max_size: DEFAULT_CHUNK_BUFFER_MAX_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            multiplexing: false,
            tls: None,
            banner: Vec::new(),
            tick: DEFAULT_TICK,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            handler,
            error_handler: ServiceErrorHandler::default(),
            mux_factory: None,
        }
    }

    /// Load the file-configurable subset from a TOML file
    ///
    /// The handler and error handler are code-only options and are taken
    /// from the arguments.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &std::path::Path, handler: Handler) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {e}")))?;

        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {e}")))?;

        Ok(file.apply(Self::new(handler)))
    }

    /// Set the bind address
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the response header timeout
    #[must_use]
    pub fn with_response_header_timeout(mut self, timeout: Duration) -> Self {
        self.response_header_timeout = timeout;
        self
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the request line limit in bytes
    #[must_use]
    pub fn with_max_request_line_len(mut self, limit: usize) -> Self {
        self.max_request_line_len = limit;
        self
    }

    /// Set the header block limit in bytes
    #[must_use]
    pub fn with_max_headers_len(mut self, limit: usize) -> Self {
        self.max_headers_len = limit;
        self
    }

    /// Set the bound on buffered body bytes per connection
    #[must_use]
    pub fn with_chunk_buffer_max_size(mut self, limit: usize) -> Self {
        self.chunk_buffer_max_size = limit;
        self
    }

    /// Set the connection cap; 0 refuses every connection
    #[must_use]
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    /// Terminate TLS with PEM certificate and key files
    #[must_use]
    pub fn with_tls_pem(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.tls = Some(TlsOptions::Pem { cert, key });
        self
    }

    /// Terminate TLS with an externally built rustls configuration
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(TlsOptions::Preconfigured(config));
        self
    }

    /// Enable multiplexed protocol negotiation with the given driver
    #[must_use]
    pub fn with_multiplexing(mut self, factory: MuxFactory) -> Self {
        self.multiplexing = true;
        self.mux_factory = Some(factory);
        self
    }

    /// Set the failure-to-response mapping for handler faults
    #[must_use]
    pub fn with_error_handler(mut self, handler: ServiceErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Set the startup banner lines
    #[must_use]
    pub fn with_banner<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.banner = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Set the timer wheel granularity
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the graceful shutdown drain timeout
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate and normalize the snapshot for startup
    ///
    /// Misconfigured timeout relations warn but never fail startup.
    /// Multiplexing without TLS is logged and disabled (there is no
    /// cleartext upgrade path), also never a startup failure.
    ///
    /// # Errors
    ///
    /// Returns error on contradictions that cannot be resolved: a zero
    /// tick or size limit, or multiplexing enabled without a driver.
    pub fn validate(mut self) -> Result<Self> {
        if self.tick.is_zero() {
            return Err(EngineError::Config("tick must be non-zero".to_string()));
        }
        if self.max_request_line_len == 0 {
            return Err(EngineError::Config(
                "max_request_line_len must be > 0".to_string(),
            ));
        }
        if self.max_headers_len == 0 {
            return Err(EngineError::Config("max_headers_len must be > 0".to_string()));
        }
        if self.chunk_buffer_max_size == 0 {
            return Err(EngineError::Config(
                "chunk_buffer_max_size must be > 0".to_string(),
            ));
        }

        if self.multiplexing && self.tls.is_none() {
            warn!("multiplexing requires TLS for protocol negotiation; falling back to HTTP/1 only");
            self.multiplexing = false;
        }
        if self.multiplexing && self.mux_factory.is_none() {
            return Err(EngineError::Config(
                "multiplexing enabled but no multiplexed connection driver configured".to_string(),
            ));
        }

        self.verify_timeout_relations();
        Ok(self)
    }

    /// Warn about timeout relations that make the header deadline moot
    fn verify_timeout_relations(&self) {
        if self.response_header_timeout >= self.idle_timeout {
            warn!(
                response_header_timeout_ms = self.response_header_timeout.as_millis() as u64,
                idle_timeout_ms = self.idle_timeout.as_millis() as u64,
                "response_header_timeout >= idle_timeout; idle reclamation will usually win"
            );
        }
    }

    /// The longest configured deadline, used to size the wheel horizon
    pub(crate) fn max_timeout(&self) -> Duration {
        self.response_header_timeout
            .max(self.request_timeout)
            .max(self.idle_timeout)
    }
}

/// File-loadable subset of [`ServerOptions`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Socket address to bind
    pub bind_addr: Option<SocketAddr>,
    /// Response header timeout in milliseconds
    pub response_header_timeout_ms: Option<u64>,
    /// Request timeout in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: Option<u64>,
    /// Request line limit in bytes
    pub max_request_line_len: Option<usize>,
    /// Header block limit in bytes
    pub max_headers_len: Option<usize>,
    /// Bound on buffered body bytes per connection
    pub chunk_buffer_max_size: Option<usize>,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// TLS PEM material
    pub tls: Option<TlsFileConfig>,
    /// Startup banner lines
    #[serde(default)]
    pub banner: Vec<String>,
}

/// TLS file paths in a config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFileConfig {
    /// Path to the PEM certificate chain
    pub cert: PathBuf,
    /// Path to the PEM private key
    pub key: PathBuf,
}

impl FileConfig {
    fn apply(self, mut options: ServerOptions) -> ServerOptions {
        if let Some(addr) = self.bind_addr {
            options.bind_addr = addr;
        }
        if let Some(ms) = self.response_header_timeout_ms {
            options.response_header_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            options.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.idle_timeout_ms {
            options.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = self.max_request_line_len {
            options.max_request_line_len = limit;
        }
        if let Some(limit) = self.max_headers_len {
            options.max_headers_len = limit;
        }
        if let Some(limit) = self.chunk_buffer_max_size {
            options.chunk_buffer_max_size = limit;
        }
        if let Some(limit) = self.max_connections {
            options.max_connections = limit;
        }
        if let Some(tls) = self.tls {
            options.tls = Some(TlsOptions::Pem {
                cert: tls.cert,
                key: tls.key,
            });
        }
        if !self.banner.is_empty() {
            options.banner = self.banner;
        }
        options
    }
}
