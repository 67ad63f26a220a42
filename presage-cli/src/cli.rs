use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use presage_engine::{ClientConfig, ResponseFormat};

use crate::error::AppError;

/// Command-line client for presage model-serving backends.
#[derive(Parser, Debug)]
#[command(name = "presage", author, version, about, long_about = None)]
pub struct Args {
    /// The project whose machines are targeted.
    #[arg(long, env = "PRESAGE_PROJECT")]
    pub project: String,

    /// The host the server is running on.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port the server is running on.
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    /// URL scheme, `http` or `https`.
    #[arg(long, default_value = "https")]
    pub scheme: String,

    /// Duration of one prediction window, in hours.
    #[arg(long, default_value_t = 24)]
    pub batch_window_hours: u64,

    /// Maximum concurrently in-flight prediction requests.
    #[arg(long, default_value_t = 10)]
    pub parallelism: usize,

    /// Response payload format, `json` or `columnar`.
    #[arg(long, default_value = "json")]
    pub format: ResponseFormat,

    /// Return all columns for predictions, including intermediate outputs.
    #[arg(long)]
    pub all_columns: bool,

    /// Pin a server revision instead of resolving the latest at run start.
    #[arg(long)]
    pub revision: Option<String>,

    /// Key=value pair entered as a metadata label; repeatable.
    #[arg(long = "metadata", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Extra HTTP header as key=value, e.g. API-KEY=foo-bar; repeatable.
    #[arg(long = "header", value_parser = parse_key_value)]
    pub headers: Vec<(String, String)>,

    /// Overall timeout for one HTTP request, in seconds. 0 disables it.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Log filter, e.g. `debug` or `presage_engine=trace`.
    #[arg(long, env = "PRESAGE_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run predictions over a time range against the target machines.
    Predict {
        /// Range start, inclusive (RFC 3339 or YYYY-MM-DD).
        #[arg(value_parser = parse_instant)]
        start: DateTime<Utc>,

        /// Range end, exclusive (RFC 3339 or YYYY-MM-DD).
        #[arg(value_parser = parse_instant)]
        end: DateTime<Utc>,

        /// Machine to target; repeatable. Targets every machine when omitted.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Data-provider spec override as JSON; must carry a `type` tag.
        #[arg(long, env = "PRESAGE_DATA_PROVIDER")]
        data_provider: Option<String>,

        /// Save per-machine prediction CSVs in this directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Destination sink URI. Format: <user>:<password>@<host>:<port>/<optional-path>/<db>.
        #[arg(long)]
        sink_uri: Option<String>,

        /// API key to present to the destination sink.
        #[arg(long, env = "PRESAGE_SINK_API_KEY")]
        sink_api_key: Option<String>,

        /// Recreate the destination database before writing.
        #[arg(long)]
        sink_recreate_db: bool,

        /// Forward resampled sensor values alongside predictions.
        #[arg(long)]
        forward_resampled: bool,

        /// Retry budget for failed prediction windows.
        #[arg(long, default_value_t = 5)]
        n_retries: u32,
    },

    /// Fetch metadata for the target machines.
    Metadata {
        /// Machine to target; repeatable. Targets every machine when omitted.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Optional file to save the metadata JSON to.
        #[arg(long)]
        output_file: Option<PathBuf>,
    },

    /// Download model artifacts into per-machine subdirectories.
    DownloadModel {
        /// Directory the artifacts are written into.
        output_dir: PathBuf,

        /// Machine to target; repeatable. Targets every machine when omitted.
        #[arg(long = "target")]
        targets: Vec<String>,
    },
}

/// Build the run configuration shared by every subcommand.
pub fn base_config(args: &Args) -> Result<ClientConfig, AppError> {
    let mut config = ClientConfig::new(args.project.as_str())
        .with_server(args.scheme.as_str(), args.host.as_str(), args.port)
        .with_batch_window(Duration::from_secs(args.batch_window_hours * 3600))
        .with_parallelism(args.parallelism)
        .with_format(args.format);
    config.all_columns = args.all_columns;
    config.revision = args.revision.clone();
    config.metadata = args.metadata.clone();
    config.session.timeout = Duration::from_secs(args.timeout_secs);
    for (name, value) in &args.headers {
        config.session.insert_header(name, value)?;
    }
    Ok(config)
}

/// Parse a timestamp argument: RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS`
/// (UTC assumed), or a bare `YYYY-MM-DD` date at midnight UTC.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, AppError> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        && let Some(naive) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(naive.and_utc());
    }
    Err(AppError::ParseError(format!(
        "invalid timestamp `{raw}` (expected RFC 3339, e.g. 2020-01-01T00:00:00Z)"
    )))
}

/// Parse a `key=value` argument, splitting at the first `=`.
pub fn parse_key_value(raw: &str) -> Result<(String, String), AppError> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| AppError::InvalidInput(format!("invalid key=value pair `{raw}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn instants_parse_from_common_shapes() {
        assert_eq!(
            parse_instant("2020-01-01T06:30:00+02:00").unwrap(),
            ts("2020-01-01T04:30:00Z")
        );
        assert_eq!(
            parse_instant("2020-01-01T06:30:00").unwrap(),
            ts("2020-01-01T06:30:00Z")
        );
        assert_eq!(
            parse_instant("2020-01-01").unwrap(),
            ts("2020-01-01T00:00:00Z")
        );
        assert!(matches!(
            parse_instant("yesterday"),
            Err(AppError::ParseError(_))
        ));
    }

    #[test]
    fn key_value_pairs_split_at_the_first_equals() {
        assert_eq!(
            parse_key_value("owner=ops").unwrap(),
            ("owner".to_string(), "ops".to_string())
        );
        assert_eq!(
            parse_key_value("filter=a=b").unwrap(),
            ("filter".to_string(), "a=b".to_string())
        );
        assert!(matches!(
            parse_key_value("no-separator"),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn predict_args_parse_with_defaults() {
        let args = Args::try_parse_from([
            "presage",
            "--project",
            "plant-7",
            "predict",
            "2020-01-01",
            "2020-01-02",
        ])
        .unwrap();

        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 443);
        assert_eq!(args.scheme, "https");
        assert_eq!(args.parallelism, 10);
        assert_eq!(args.format, ResponseFormat::Json);
        match args.command {
            Commands::Predict {
                start,
                end,
                targets,
                n_retries,
                ..
            } => {
                assert_eq!(start, ts("2020-01-01T00:00:00Z"));
                assert_eq!(end, ts("2020-01-02T00:00:00Z"));
                assert!(targets.is_empty());
                assert_eq!(n_retries, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_options_map_onto_the_run_configuration() {
        let args = Args::try_parse_from([
            "presage",
            "--project",
            "plant-7",
            "--host",
            "models.internal",
            "--port",
            "8443",
            "--batch-window-hours",
            "6",
            "--metadata",
            "owner=ops",
            "--header",
            "API-KEY=foo-bar",
            "--all-columns",
            "metadata",
        ])
        .unwrap();

        let config = base_config(&args).unwrap();
        assert_eq!(config.project, "plant-7");
        assert_eq!(config.host, "models.internal");
        assert_eq!(config.port, 8443);
        assert_eq!(config.batch_window, Duration::from_secs(6 * 3600));
        assert!(config.all_columns);
        assert_eq!(
            config.metadata,
            [("owner".to_string(), "ops".to_string())]
        );
        assert_eq!(config.session.headers.get("api-key").unwrap(), "foo-bar");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn repeated_targets_accumulate() {
        let args = Args::try_parse_from([
            "presage",
            "--project",
            "plant-7",
            "download-model",
            "/tmp/models",
            "--target",
            "a",
            "--target",
            "b",
        ])
        .unwrap();

        match args.command {
            Commands::DownloadModel {
                output_dir,
                targets,
            } => {
                assert_eq!(output_dir, PathBuf::from("/tmp/models"));
                assert_eq!(targets, ["a", "b"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
