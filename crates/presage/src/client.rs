// Prediction run orchestrator: resolves run-wide parameters, spawns the
// dispatcher and assembler, forwards per-machine results when a sink is
// configured, and hands back the merged result.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ModelServer, RevisionsResponse, WindowFetcher};
use crate::assemble::{ResultAssembler, RunResult, WindowError};
use crate::codec::CodecOptions;
use crate::config::ClientConfig;
use crate::dispatch::{WindowDispatcher, WorkItem};
use crate::error::ClientError;
use crate::forward::{InfluxForwarder, PredictionForwarder};
use crate::plan::{self, TimeWindow};
use crate::provider;
use crate::retry::{RetryAction, retry_with_backoff};
use crate::schemas::{Machine, Metadata};

/// Client for one model-server project.
///
/// Holds the pooled HTTP client; a `Client` is cheap to keep around and runs
/// any number of operations. Run-wide parameters (revision, machine set,
/// window plan) are resolved per operation, never cached between runs.
pub struct Client {
    config: ClientConfig,
    server: ModelServer,
    forwarder: Option<Arc<dyn PredictionForwarder>>,
}

impl Client {
    /// Validate the configuration and build the HTTP session. A sink target
    /// in the configuration becomes the run's forwarder.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let http = crate::create_client(&config.session)?;
        let server = ModelServer::new(http.clone(), config.base_url()?, &config.project);
        let forwarder = match &config.sink {
            Some(target) => Some(Arc::new(InfluxForwarder::from_target(
                http,
                target,
                config.metadata.clone(),
            )?) as Arc<dyn PredictionForwarder>),
            None => None,
        };
        Ok(Self {
            config,
            server,
            forwarder,
        })
    }

    /// Replace the forwarder built from the configuration.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn PredictionForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run an endpoint call under the configured retry policy, retrying only
    /// failures the error taxonomy marks transient.
    async fn retried<T, F, Fut>(
        &self,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        retry_with_backoff(&self.config.retry, token, |_| {
            let call = operation();
            async move {
                match call.await {
                    Ok(value) => RetryAction::Success(value),
                    Err(e) if e.is_retryable() => RetryAction::Retry(e),
                    Err(e) => RetryAction::Fail(e),
                }
            }
        })
        .await
    }

    /// Latest and available model revisions for the project.
    pub async fn get_revisions(
        &self,
        token: &CancellationToken,
    ) -> Result<RevisionsResponse, ClientError> {
        self.retried(token, || self.server.get_revisions()).await
    }

    /// Machines served for `revision` (the server default when `None`),
    /// filtered to `targets` when non-empty.
    pub async fn get_machines(
        &self,
        targets: &[String],
        revision: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Vec<Machine>, ClientError> {
        let models = self
            .retried(token, || self.server.get_models(revision))
            .await?;
        select_targets(models, targets)
    }

    pub async fn get_machine_names(
        &self,
        revision: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Vec<String>, ClientError> {
        let machines = self.get_machines(&[], revision, token).await?;
        Ok(machines.into_iter().map(|machine| machine.name).collect())
    }

    /// Metadata per target machine, keyed by machine name.
    pub async fn get_metadata(
        &self,
        targets: &[String],
        token: &CancellationToken,
    ) -> Result<BTreeMap<String, Metadata>, ClientError> {
        let revision = self.resolve_revision(token).await?;
        let machines = self.get_machines(targets, Some(&revision), token).await?;

        let mut metadata = BTreeMap::new();
        for machine in &machines {
            let fetched = self
                .retried(token, || {
                    self.server.get_metadata(&machine.name, Some(&revision))
                })
                .await?;
            metadata.insert(machine.name.clone(), fetched);
        }
        Ok(metadata)
    }

    /// Model artifact bytes per target machine, keyed by machine name.
    pub async fn download_model(
        &self,
        targets: &[String],
        token: &CancellationToken,
    ) -> Result<BTreeMap<String, Bytes>, ClientError> {
        let revision = self.resolve_revision(token).await?;
        let machines = self.get_machines(targets, Some(&revision), token).await?;

        let mut models = BTreeMap::new();
        for machine in &machines {
            let artifact = self
                .retried(token, || self.server.download_model(&machine.name))
                .await?;
            models.insert(machine.name.clone(), artifact);
        }
        Ok(models)
    }

    /// Run predictions over `[start, end)` against the target machines.
    ///
    /// Fails only for prerequisite failures: an invalid range, an unknown
    /// provider tag, or an unresolvable revision or machine set. Per-window
    /// failures land in the result's error lists, and a cancelled run returns
    /// the outcomes that reached a terminal state before the token fired.
    pub async fn predict(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        targets: &[String],
        token: &CancellationToken,
    ) -> Result<RunResult, ClientError> {
        let windows = plan::plan_windows(start, end, self.config.batch_window)?;
        let data_provider = self
            .config
            .data_provider
            .as_ref()
            .map(provider::resolve_provider)
            .transpose()?;

        let revision = self.resolve_revision(token).await?;
        let machines: Vec<Arc<Machine>> = self
            .get_machines(targets, Some(&revision), token)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

        let items: Vec<WorkItem> = machines
            .iter()
            .flat_map(|machine| {
                windows.iter().map(move |window| WorkItem {
                    machine: Arc::clone(machine),
                    window: *window,
                })
            })
            .collect();

        info!(
            project = %self.config.project,
            revision = %revision,
            machines = machines.len(),
            windows = windows.len(),
            items = items.len(),
            parallelism = self.config.parallelism,
            "Starting prediction run"
        );

        let options = CodecOptions {
            format: self.config.format,
            revision,
            all_columns: self.config.all_columns,
            data_provider,
        };
        let fetcher: Arc<dyn WindowFetcher> = Arc::new(self.server.executor(options));
        let dispatcher = WindowDispatcher::new(
            fetcher,
            self.config.retry.clone(),
            self.config.parallelism,
            token.clone(),
        );

        let (outcome_tx, outcome_rx) = mpsc::channel(self.config.parallelism * 2);
        let assembler = ResultAssembler::new(machines.iter().map(|machine| machine.name.clone()));

        let dispatch_handle = tokio::spawn(async move {
            dispatcher.run(items, outcome_tx).await;
        });
        let mut result = assembler.run(outcome_rx).await?;
        dispatch_handle
            .await
            .map_err(|e| ClientError::internal(format!("dispatcher task failed: {e}")))?;

        if let Some(forwarder) = &self.forwarder {
            self.forward_results(forwarder, &machines, &mut result, start, end, token)
                .await;
        }

        Ok(result)
    }

    /// The revision every window of a run is pinned to: the configured pin
    /// when set, the server's latest otherwise. A pin skips the server
    /// lookup entirely.
    async fn resolve_revision(&self, token: &CancellationToken) -> Result<String, ClientError> {
        if let Some(pinned) = self.config.revision.as_deref() {
            return choose_revision(Some(pinned), "");
        }
        let revisions = self.retried(token, || self.server.get_revisions()).await?;
        choose_revision(None, &revisions.latest)
    }

    /// Deliver assembled results to the sink, one machine at a time.
    /// Delivery failures become error entries on the machine, never an `Err`.
    async fn forward_results(
        &self,
        forwarder: &Arc<dyn PredictionForwarder>,
        machines: &[Arc<Machine>],
        result: &mut RunResult,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        token: &CancellationToken,
    ) {
        let run_window = TimeWindow { start, end };

        if let Err(e) = forwarder.prepare().await {
            warn!(error = %e, "Sink preparation failed, skipping forwarding");
            for entry in result.machines.values_mut() {
                if entry.frame.is_empty() && entry.resampled.is_none() {
                    continue;
                }
                entry.errors.push(WindowError {
                    window: run_window,
                    attempts: 1,
                    message: format!("forwarding skipped: {e}"),
                });
            }
            return;
        }

        for machine in machines {
            let Some(entry) = result.machines.get(&machine.name) else {
                continue;
            };
            if entry.frame.is_empty() && entry.resampled.is_none() {
                continue;
            }

            let attempts = AtomicU32::new(0);
            let delivery = retry_with_backoff(&self.config.retry, token, |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                let resampled = entry
                    .resampled
                    .as_ref()
                    .filter(|_| self.config.forward_resampled);
                async move {
                    match forwarder.forward(machine, &entry.frame, resampled).await {
                        Ok(()) => RetryAction::Success(()),
                        Err(e) if e.is_retryable() => RetryAction::Retry(e),
                        Err(e) => RetryAction::Fail(e),
                    }
                }
            })
            .await;

            if let Err(e) = delivery {
                warn!(machine = %machine.name, error = %e, "Forwarding failed");
                if let Some(entry) = result.machines.get_mut(&machine.name) {
                    entry.errors.push(WindowError {
                        window: run_window,
                        attempts: attempts.load(Ordering::Relaxed),
                        message: format!("forwarding failed: {e}"),
                    });
                }
            }
        }
    }
}

/// Pick the revision for a run. An explicit pin wins regardless of
/// `latest`; otherwise the server's latest is adopted, and an empty
/// `latest` means the server has nothing built for the project.
fn choose_revision(pinned: Option<&str>, latest: &str) -> Result<String, ClientError> {
    if let Some(revision) = pinned {
        return Ok(revision.to_string());
    }
    if latest.is_empty() {
        return Err(ClientError::revision(
            "server reported an empty latest revision",
        ));
    }
    Ok(latest.to_string())
}

/// Filter the project's machines down to the requested targets.
///
/// An empty target list selects every machine; a target the server does not
/// serve fails the whole resolution.
fn select_targets(models: Vec<Machine>, targets: &[String]) -> Result<Vec<Machine>, ClientError> {
    if targets.is_empty() {
        return Ok(models);
    }

    let mut by_name: HashMap<String, Machine> = models
        .into_iter()
        .map(|machine| (machine.name.clone(), machine))
        .collect();
    let mut selected: Vec<Machine> = Vec::with_capacity(targets.len());
    for target in targets {
        match by_name.remove(target) {
            Some(machine) => selected.push(machine),
            None => {
                if selected.iter().any(|machine| &machine.name == target) {
                    continue;
                }
                return Err(ClientError::MachineNotFound {
                    machine: target.clone(),
                });
            }
        }
    }
    Ok(selected)
}
