use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::ClientError;
use crate::retry::RetryPolicy;

pub const DEFAULT_SCHEME: &str = "https";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 443;
/// Nominal duration of one prediction window.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Concurrently in-flight prediction requests per run.
pub const DEFAULT_PARALLELISM: usize = 10;

pub const USER_AGENT: &str = concat!("presage/", env!("CARGO_PKG_VERSION"));

/// Wire format requested for prediction responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    #[default]
    Json,
    Columnar,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Columnar => "columnar",
        }
    }
}

impl FromStr for ResponseFormat {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "columnar" => Ok(Self::Columnar),
            other => Err(ClientError::configuration(format!(
                "unknown response format `{other}` (expected `json` or `columnar`)"
            ))),
        }
    }
}

impl std::fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for forwarded prediction results.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    /// Sink connection URI.
    pub uri: String,
    /// Optional API key sent with every write.
    pub api_key: Option<String>,
    /// Drop and recreate the destination database before writing.
    pub recreate: bool,
}

/// HTTP session settings applied to every request of a run.
///
/// This is a closed set: every transport knob the client supports is a named
/// field here, validated at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Overall timeout for one HTTP request.
    pub timeout: Duration,

    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Custom HTTP headers for requests.
    pub headers: HeaderMap,
}

impl SessionConfig {
    /// Add an extra header sent with every request of the session.
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<(), ClientError> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::configuration(format!("invalid header name `{name}`: {e}")))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            ClientError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        self.headers.insert(header_name, header_value);
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            user_agent: USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
        }
    }
}

/// Run-level configuration for the prediction client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URL scheme for the model server, `http` or `https`.
    pub scheme: String,

    /// Model server host.
    pub host: String,

    /// Model server port.
    pub port: u16,

    /// Project whose machines are queried.
    pub project: String,

    /// Nominal duration of one prediction window.
    pub batch_window: Duration,

    /// Maximum concurrently in-flight prediction requests.
    pub parallelism: usize,

    /// Retry behavior for transient per-window failures.
    pub retry: RetryPolicy,

    /// Wire format requested for prediction responses.
    pub format: ResponseFormat,

    /// Ask the server to include every intermediate model output column.
    pub all_columns: bool,

    /// Hand resampled input values to the forwarder alongside predictions.
    pub forward_resampled: bool,

    /// Pin a server revision instead of resolving `latest` at run start.
    pub revision: Option<String>,

    /// Override of the machines' data-provider spec. Must carry a `type`
    /// tag from the registered provider set.
    pub data_provider: Option<serde_json::Value>,

    /// When set, assembled results are forwarded here per machine.
    pub sink: Option<SinkTarget>,

    /// Labels attached to forwarded results.
    pub metadata: Vec<(String, String)>,

    /// HTTP session settings.
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_owned(),
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            project: project.into(),
            batch_window: DEFAULT_BATCH_WINDOW,
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            format: ResponseFormat::default(),
            all_columns: false,
            forward_resampled: false,
            revision: None,
            data_provider: None,
            sink: None,
            metadata: Vec::new(),
            session: SessionConfig::default(),
        }
    }

    pub fn with_server(mut self, scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.scheme = scheme.into();
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Check the configuration before any network traffic happens.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.project.is_empty() {
            return Err(ClientError::configuration("project must not be empty"));
        }
        if self.host.is_empty() {
            return Err(ClientError::configuration("host must not be empty"));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ClientError::configuration(format!(
                "unsupported scheme `{}` (expected `http` or `https`)",
                self.scheme
            )));
        }
        if self.parallelism == 0 {
            return Err(ClientError::configuration(
                "parallelism must be at least 1",
            ));
        }
        if self.batch_window.is_zero() {
            return Err(ClientError::configuration(
                "batch window duration must be positive",
            ));
        }
        if let Some(spec) = &self.data_provider {
            if spec.get("type").and_then(serde_json::Value::as_str).is_none() {
                return Err(ClientError::configuration(
                    "data provider override must carry a string `type` tag",
                ));
            }
        }
        Ok(())
    }

    /// Root URL of the model server API for the configured project.
    pub fn base_url(&self) -> Result<Url, ClientError> {
        let raw = format!("{}://{}:{}/presage/v1/", self.scheme, self.host, self.port);
        Url::parse(&raw).map_err(|e| ClientError::invalid_url(raw, e.to_string()))
    }
}
