// Model server API: thin wrappers over the discovery, metadata and artifact
// endpoints, plus the WindowFetcher boundary the dispatcher runs against.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::codec::{self, CodecOptions};
use crate::dispatch::Outcome;
use crate::error::ClientError;
use crate::plan::TimeWindow;
use crate::schemas::{Machine, Metadata};

/// Boundary between the dispatcher and the network: fetch predictions for
/// one machine over one window. Implementations classify every failure into
/// the outcome's retryable flag; they never retry internally.
#[async_trait]
pub trait WindowFetcher: Send + Sync {
    async fn fetch_window(&self, machine: &Machine, window: &TimeWindow) -> Outcome;
}

#[derive(Deserialize, Debug, Clone)]
pub struct RevisionsResponse {
    /// Revision the server currently serves by default.
    pub latest: String,
    #[serde(default)]
    pub available_revisions: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct ModelsResponse {
    models: Vec<Machine>,
    #[allow(dead_code)]
    revision: Option<String>,
}

#[derive(Deserialize, Debug)]
struct MetadataResponse {
    metadata: Metadata,
    #[allow(dead_code)]
    revision: Option<String>,
}

/// Wrapper over the model server's project-scoped REST surface.
pub struct ModelServer {
    http: Client,
    base: Url,
    project: String,
}

impl ModelServer {
    pub fn new(http: Client, base: Url, project: impl Into<String>) -> Self {
        Self {
            http,
            base,
            project: project.into(),
        }
    }

    /// Build the URL for a project-scoped endpoint path.
    fn endpoint_url(&self, path: &str) -> Result<Url, ClientError> {
        endpoint_url(&self.base, &self.project, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<T, ClientError> {
        trace!(url = %url, operation, "Requesting");
        let response = self.http.get(url.clone()).query(query).send().await?;
        let status = response.status();
        if status == StatusCode::GONE {
            return Err(ClientError::resource_gone(url));
        }
        if !status.is_success() {
            return Err(ClientError::http_status(status, url, operation));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::protocol(format!("malformed {operation} response: {e}")))
    }

    /// `GET {base}/{project}/revisions`
    pub async fn get_revisions(&self) -> Result<RevisionsResponse, ClientError> {
        let url = self.endpoint_url("revisions")?;
        self.get_json(url, &[], "revision listing").await
    }

    /// `GET {base}/{project}/models[?revision=]`
    pub async fn get_models(&self, revision: Option<&str>) -> Result<Vec<Machine>, ClientError> {
        let url = self.endpoint_url("models")?;
        let query: Vec<(&str, &str)> = revision.map(|r| ("revision", r)).into_iter().collect();
        let response: ModelsResponse = self.get_json(url, &query, "model listing").await?;
        Ok(response.models)
    }

    /// `GET {base}/{project}/{machine}/metadata?revision=`
    pub async fn get_metadata(
        &self,
        machine: &str,
        revision: Option<&str>,
    ) -> Result<Metadata, ClientError> {
        let url = self.endpoint_url(&format!("{machine}/metadata"))?;
        let query: Vec<(&str, &str)> = revision.map(|r| ("revision", r)).into_iter().collect();
        let response: MetadataResponse = self.get_json(url, &query, "machine metadata").await?;
        Ok(response.metadata)
    }

    /// `GET {base}/{project}/{machine}/download-model`
    ///
    /// The artifact is streamed in chunks to avoid one large read.
    pub async fn download_model(&self, machine: &str) -> Result<Bytes, ClientError> {
        let url = self.endpoint_url(&format!("{machine}/download-model"))?;
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::GONE {
            return Err(ClientError::resource_gone(url));
        }
        if !status.is_success() {
            return Err(ClientError::http_status(status, url, "model download"));
        }

        let content_length = response.content_length().unwrap_or(0) as usize;
        let mut buffer = BytesMut::with_capacity(content_length);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ClientError::from)?;
            buffer.extend_from_slice(&chunk);
        }
        debug!(machine, bytes = buffer.len(), "Downloaded model artifact");
        Ok(buffer.freeze())
    }

    /// Build the executor that performs prediction requests for the run.
    ///
    /// The options carry the revision resolved for this run, so every window
    /// the executor serves is pinned to it.
    pub fn executor(&self, options: CodecOptions) -> PredictionExecutor {
        PredictionExecutor {
            http: self.http.clone(),
            base: self.base.clone(),
            project: self.project.clone(),
            options,
        }
    }
}

/// Production [`WindowFetcher`]: one POST per (machine, window) against the
/// prediction endpoint, classified into an [`Outcome`] by the codec.
pub struct PredictionExecutor {
    http: Client,
    base: Url,
    project: String,
    options: CodecOptions,
}

#[async_trait]
impl WindowFetcher for PredictionExecutor {
    #[instrument(skip(self, machine, window), fields(machine = %machine.name, window = %window))]
    async fn fetch_window(&self, machine: &Machine, window: &TimeWindow) -> Outcome {
        let request = codec::encode_request(machine, window, &self.options);
        let url = match endpoint_url(&self.base, &self.project, &request.path) {
            Ok(url) => url,
            Err(e) => return Outcome::failure(e.to_string(), false),
        };

        let response = match self
            .http
            .post(url)
            .query(&request.query)
            .json(&request.body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let retryable =
                    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode();
                return Outcome::failure(format!("request failed: {e}"), retryable);
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return Outcome::failure(format!("failed to read response body: {e}"), true);
            }
        };

        codec::decode_response(status, content_type.as_deref(), &body)
    }
}

/// Join a project-scoped endpoint path onto the API base URL.
fn endpoint_url(base: &Url, project: &str, path: &str) -> Result<Url, ClientError> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| ClientError::invalid_url(base.as_str(), "URL cannot be a base"))?;
        segments.pop_if_empty().push(project);
        for segment in path.split('/') {
            segments.push(segment);
        }
    }
    Ok(url)
}
