//! Client engine for machine-model prediction servers.
//!
//! Splits a prediction range into fixed time windows, fetches every
//! (machine, window) pair under bounded concurrency with retries, and
//! reassembles the completed windows per machine in chronological order.

use std::sync::Arc;

use rustls::crypto::ring;
use rustls_platform_verifier::BuilderVerifierExt;

pub mod api;
pub mod assemble;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod frame;
pub mod plan;
pub mod provider;
pub mod retry;
pub mod schemas;

pub use crate::{
    api::{ModelServer, PredictionExecutor, RevisionsResponse, WindowFetcher},
    assemble::{PredictionResult, ResultAssembler, RunResult, WindowError},
    client::Client,
    codec::CodecOptions,
    config::{ClientConfig, ResponseFormat, SessionConfig, SinkTarget},
    dispatch::{Outcome, WindowDispatcher, WindowOutcome, WorkItem},
    error::ClientError,
    forward::{InfluxForwarder, PredictionForwarder},
    frame::{FrameRow, PredictionFrame},
    plan::{TimeWindow, plan_windows},
    retry::RetryPolicy,
    schemas::{Machine, Metadata},
};

/// Create a reqwest Client with the provided session configuration.
pub fn create_client(config: &SessionConfig) -> Result<reqwest::Client, ClientError> {
    let provider = Arc::new(ring::default_provider());

    // Build platform default TLS configuration
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("Failed to configure default TLS protocol versions")
        .with_platform_verifier()
        .with_no_client_auth();

    let mut client_builder = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config);

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    Ok(client_builder.build()?)
}
