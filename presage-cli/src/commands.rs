use std::path::Path;

use chrono::{DateTime, Utc};
use presage_engine::{Client, ClientConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::output;

/// Runs subcommands against one configured client.
pub struct CommandExecutor {
    client: Client,
}

impl CommandExecutor {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            client: Client::new(config)?,
        })
    }

    /// Run predictions over `[start, end)` and report per-machine failures.
    ///
    /// Returns the process exit code: 1 when any machine lost a window,
    /// 0 otherwise. A cancelled run still reports whatever completed.
    pub async fn predict(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        targets: &[String],
        output_dir: Option<&Path>,
        token: &CancellationToken,
    ) -> Result<i32> {
        let run = self.client.predict(start, end, targets, token).await?;

        println!(
            "\n{dashes} Summary of failed predictions (if any) {dashes}",
            dashes = "-".repeat(20)
        );
        let mut exit_code = 0;
        for (name, result) in &run.machines {
            for error in &result.errors {
                exit_code = 1;
                println!("{name}: {error}");
            }
        }

        if let Some(dir) = output_dir {
            for (name, result) in &run.machines {
                let path = output::write_prediction_csv(dir, name, result)?;
                info!(machine = %name, path = %path.display(), "wrote predictions");
            }
        }

        let completed: usize = run
            .machines
            .values()
            .map(|result| result.frame.len())
            .sum();
        info!(
            machines = run.machines.len(),
            rows = completed,
            failed = run.failed_machines().len(),
            "prediction run finished"
        );
        Ok(exit_code)
    }

    /// Print metadata for the target machines, or save it as JSON.
    pub async fn metadata(
        &self,
        targets: &[String],
        output_file: Option<&Path>,
        token: &CancellationToken,
    ) -> Result<i32> {
        let metadata = self.client.get_metadata(targets, token).await?;
        let rendered = serde_json::to_string_pretty(&metadata)?;

        match output_file {
            Some(path) => {
                std::fs::write(path, rendered)?;
                println!("Saved metadata json to file: '{}'", path.display());
            }
            None => println!("{rendered}"),
        }
        Ok(0)
    }

    /// Download model artifacts into one subdirectory per machine.
    pub async fn download_model(
        &self,
        output_dir: &Path,
        targets: &[String],
        token: &CancellationToken,
    ) -> Result<i32> {
        let models = self.client.download_model(targets, token).await?;

        for (name, artifact) in &models {
            let machine_dir = output_dir.join(name);
            let path = output::write_model(&machine_dir, artifact)?;
            println!("Wrote model '{name}' to '{}'", path.display());
        }

        println!("Wrote all models to directory: {}", output_dir.display());
        Ok(0)
    }
}
