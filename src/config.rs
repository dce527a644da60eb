//! Configuration for elohim-graphql-ws
//!
//! Two layers:
//! - [`ClientConfig`]: the plain, serializable settings (loadable from TOML)
//! - [`ClientOptions`]: everything the client needs at runtime, including the
//!   callbacks and the transport connector

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ClientError;
use crate::events::{ClientEvent, EventListener};
use crate::protocol::{CloseEvent, Payload, ValueTransform};
use crate::retry::default_retry_wait;
use crate::transport::{Connector, WsConnector};

/// `retry_attempts` value that never exhausts
pub const RETRY_FOREVER: u32 = u32::MAX;

/// Resolves the connection target.
pub type UrlResolver = Arc<dyn Fn() -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Produces the `connection_init` payload.
pub type ParamsResolver =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Payload>, String>> + Send + Sync>;

/// Waits before a reconnect, given the number of retries so far.
pub type RetryWait = Arc<dyn Fn(u32) -> BoxFuture<'static, ()> + Send + Sync>;

/// Decides whether a closure should stop retrying.
pub type FatalPredicate = Arc<dyn Fn(&CloseEvent) -> bool + Send + Sync>;

/// Generates operation ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Receives unrecoverable errors of the non-lazy connection.
pub type ErrorHook = Arc<dyn Fn(ClientError) + Send + Sync>;

/// Where to connect.
#[derive(Clone)]
pub enum UrlSource {
    Static(String),
    Dynamic(UrlResolver),
}

impl UrlSource {
    pub async fn resolve(&self) -> Result<String, ClientError> {
        match self {
            UrlSource::Static(url) => Ok(url.clone()),
            UrlSource::Dynamic(resolver) => resolver()
                .await
                .map_err(|e| ClientError::Config(format!("Failed to resolve URL: {}", e))),
        }
    }
}

/// What to send with `connection_init`.
#[derive(Clone, Default)]
pub enum ConnectionParams {
    #[default]
    None,
    Static(Payload),
    Dynamic(ParamsResolver),
}

impl ConnectionParams {
    /// Errors are plain messages; they become the close reason.
    pub async fn resolve(&self) -> Result<Option<Payload>, String> {
        match self {
            ConnectionParams::None => Ok(None),
            ConnectionParams::Static(payload) => Ok(Some(payload.clone())),
            ConnectionParams::Dynamic(resolver) => resolver().await,
        }
    }
}

/// Runtime options of a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) url: UrlSource,
    pub(crate) connection_params: ConnectionParams,
    pub(crate) lazy: bool,
    pub(crate) keep_alive: Duration,
    pub(crate) retry_attempts: u32,
    pub(crate) retry_wait: RetryWait,
    pub(crate) is_fatal_connection_problem: Option<FatalPredicate>,
    pub(crate) connection_ack_wait_timeout: Option<Duration>,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) disable_pong: bool,
    pub(crate) generate_id: IdGenerator,
    pub(crate) on_non_lazy_error: Option<ErrorHook>,
    pub(crate) listeners: Vec<EventListener>,
    pub(crate) json_reviver: Option<ValueTransform>,
    pub(crate) json_replacer: Option<ValueTransform>,
    pub(crate) connector: Arc<dyn Connector>,
}

impl ClientOptions {
    /// Options with defaults for a fixed URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: UrlSource::Static(url.into()),
            connection_params: ConnectionParams::None,
            lazy: true,
            keep_alive: Duration::ZERO,
            retry_attempts: 5,
            retry_wait: Arc::new(|retries| default_retry_wait(retries).boxed()),
            is_fatal_connection_problem: None,
            connection_ack_wait_timeout: None,
            ping_interval: None,
            disable_pong: false,
            generate_id: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            on_non_lazy_error: None,
            listeners: Vec::new(),
            json_reviver: None,
            json_replacer: None,
            connector: Arc::new(WsConnector),
        }
    }

    /// Resolve the URL on every connection attempt.
    pub fn url_with<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.url = UrlSource::Dynamic(Arc::new(move || resolver().boxed()));
        self
    }

    pub fn connection_params(mut self, payload: Payload) -> Self {
        self.connection_params = ConnectionParams::Static(payload);
        self
    }

    /// Evaluate the `connection_init` payload on every connection attempt.
    /// An error closes the socket with 4400 and the error as the reason.
    pub fn connection_params_with<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Payload>, String>> + Send + 'static,
    {
        self.connection_params = ConnectionParams::Dynamic(Arc::new(move || resolver().boxed()));
        self
    }

    /// `false` connects immediately and keeps the connection open for the
    /// lifetime of the client.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// How long an idle lazy connection stays open after the last operation.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Reconnect budget; [`RETRY_FOREVER`] never gives up.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn retry_wait<F, Fut>(mut self, wait: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.retry_wait = Arc::new(move |retries| wait(retries).boxed());
        self
    }

    pub fn is_fatal_connection_problem<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CloseEvent) -> bool + Send + Sync + 'static,
    {
        self.is_fatal_connection_problem = Some(Arc::new(predicate));
        self
    }

    pub fn connection_ack_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_ack_wait_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Send a `ping` on this interval once the connection is acknowledged.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Do not answer the peer's pings.
    pub fn disable_pong(mut self, disable: bool) -> Self {
        self.disable_pong = disable;
        self
    }

    pub fn generate_id<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generate_id = Arc::new(generator);
        self
    }

    pub fn on_non_lazy_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.on_non_lazy_error = Some(Arc::new(hook));
        self
    }

    pub fn on_event<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn json_reviver<F>(mut self, reviver: F) -> Self
    where
        F: Fn(&str, serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.json_reviver = Some(Arc::new(reviver));
        self
    }

    pub fn json_replacer<F>(mut self, replacer: F) -> Self
    where
        F: Fn(&str, serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.json_replacer = Some(Arc::new(replacer));
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = match &self.url {
            UrlSource::Static(url) => url.as_str(),
            UrlSource::Dynamic(_) => "<dynamic>",
        };
        f.debug_struct("ClientOptions")
            .field("url", &url)
            .field("lazy", &self.lazy)
            .field("keep_alive", &self.keep_alive)
            .field("retry_attempts", &self.retry_attempts)
            .field("connection_ack_wait_timeout", &self.connection_ack_wait_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("disable_pong", &self.disable_pong)
            .finish_non_exhaustive()
    }
}

/// Serializable client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the GraphQL endpoint
    pub url: String,

    /// Connect on the first operation rather than immediately
    #[serde(default = "default_true")]
    pub lazy: bool,

    /// Idle time before a lazy connection is closed (0 = close at once)
    #[serde(default)]
    pub keep_alive_ms: u64,

    /// Reconnect budget (4294967295 = forever)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Handshake timeout (0 = wait forever)
    #[serde(default)]
    pub connection_ack_wait_timeout_ms: u64,

    /// Client ping interval (0 = never ping)
    #[serde(default)]
    pub ping_interval_ms: u64,

    /// Do not answer the peer's pings
    #[serde(default)]
    pub disable_pong: bool,

    /// Static `connection_init` payload
    #[serde(default)]
    pub connection_params: Option<Payload>,
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    5
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            lazy: true,
            keep_alive_ms: 0,
            retry_attempts: default_retry_attempts(),
            connection_ack_wait_timeout_ms: 0,
            ping_interval_ms: 0,
            disable_pong: false,
            connection_params: None,
        }
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ClientError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ClientError> {
        toml::from_str(content).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        let content = toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            ClientError::Config(format!("Failed to write {}: {}", path.as_ref().display(), e))
        })
    }

    /// Runtime options with these settings and default callbacks.
    pub fn into_options(self) -> ClientOptions {
        let mut options = ClientOptions::new(self.url)
            .lazy(self.lazy)
            .keep_alive(Duration::from_millis(self.keep_alive_ms))
            .retry_attempts(self.retry_attempts)
            .connection_ack_wait_timeout(Duration::from_millis(self.connection_ack_wait_timeout_ms))
            .ping_interval(Duration::from_millis(self.ping_interval_ms))
            .disable_pong(self.disable_pong);
        if let Some(params) = self.connection_params {
            options = options.connection_params(params);
        }
        options
    }
}
