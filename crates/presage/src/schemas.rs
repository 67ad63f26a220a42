//! Machine description and build metadata as served by the model server.
//!
//! Unknown blob-level keys (model and dataset configuration) stay opaque
//! JSON values; only the fields the client acts on are typed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named machine with its model and dataset configuration, scoped to a
/// project. Immutable once resolved for a run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub project_name: String,
    /// Serving host, derived from project and name when the server omits it.
    #[serde(default)]
    pub host: Option<String>,
    /// Opaque model configuration blob.
    #[serde(default)]
    pub model: Value,
    /// Opaque dataset configuration blob, including the data-provider spec.
    #[serde(default)]
    pub dataset: Value,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub runtime: Value,
    #[serde(default)]
    pub evaluation: Evaluation,
}

impl Machine {
    pub fn new(name: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project_name: project_name.into(),
            host: None,
            model: Value::Null,
            dataset: Value::Null,
            metadata: Metadata::default(),
            runtime: Value::Null,
            evaluation: Evaluation::default(),
        }
    }

    /// The host serving this machine's model.
    pub fn server_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => format!("presage-server-{}-{}", self.project_name, self.name),
        }
    }

    /// The `type` tag of the dataset's data-provider spec, when present.
    pub fn data_provider_tag(&self) -> Option<&str> {
        self.dataset
            .get("data_provider")
            .and_then(|provider| provider.get("type"))
            .and_then(Value::as_str)
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_name, self.name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Metadata {
    /// Free-form labels attached by whoever configured the machine.
    #[serde(default)]
    pub user_defined: HashMap<String, Value>,
    #[serde(default)]
    pub build_metadata: BuildMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BuildMetadata {
    #[serde(default)]
    pub model: ModelBuildMetadata,
    #[serde(default)]
    pub dataset: DatasetBuildMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ModelBuildMetadata {
    /// Rows the model output lags behind its input.
    #[serde(default)]
    pub model_offset: i64,
    #[serde(default)]
    pub model_creation_date: Option<String>,
    #[serde(default)]
    pub model_builder_version: Option<String>,
    #[serde(default)]
    pub cross_validation: CrossValidation,
    #[serde(default)]
    pub model_training_duration_sec: Option<f64>,
    #[serde(default)]
    pub model_meta: HashMap<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CrossValidation {
    #[serde(default)]
    pub scores: HashMap<String, Value>,
    #[serde(default)]
    pub cv_duration_sec: Option<f64>,
    #[serde(default)]
    pub splits: HashMap<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DatasetBuildMetadata {
    #[serde(default)]
    pub query_duration_sec: Option<f64>,
    #[serde(default)]
    pub dataset_meta: HashMap<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Evaluation {
    #[serde(default = "default_cv_mode")]
    pub cv_mode: String,
}

impl Default for Evaluation {
    fn default() -> Self {
        Self {
            cv_mode: default_cv_mode(),
        }
    }
}

fn default_cv_mode() -> String {
    "full_build".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_machine_fills_defaults() {
        let machine: Machine =
            serde_json::from_value(json!({ "name": "m1", "project_name": "proj" })).unwrap();

        assert_eq!(machine.server_host(), "presage-server-proj-m1");
        assert_eq!(machine.evaluation.cv_mode, "full_build");
        assert!(machine.metadata.user_defined.is_empty());
        assert_eq!(machine.data_provider_tag(), None);
    }

    #[test]
    fn explicit_host_wins_over_derived() {
        let machine: Machine = serde_json::from_value(json!({
            "name": "m1",
            "project_name": "proj",
            "host": "model-host.internal"
        }))
        .unwrap();
        assert_eq!(machine.server_host(), "model-host.internal");
    }

    #[test]
    fn full_machine_round_trips() {
        let machine: Machine = serde_json::from_value(json!({
            "name": "compressor-a",
            "project_name": "plant-7",
            "dataset": {
                "type": "time-series",
                "resolution": "10T",
                "tag_list": ["sensor-1", "sensor-2"],
                "data_provider": { "type": "random", "min_size": 100 }
            },
            "model": { "pca": { "svd_solver": "auto" } },
            "metadata": {
                "user_defined": { "owner": "ops" },
                "build_metadata": {
                    "model": {
                        "model_offset": 4,
                        "model_creation_date": "2020-01-01 00:00:00+00:00",
                        "cross_validation": {
                            "cv_duration_sec": 12.5,
                            "scores": { "explained-variance": { "mean": 0.9 } }
                        }
                    },
                    "dataset": { "query_duration_sec": 3.2 }
                }
            }
        }))
        .unwrap();

        assert_eq!(machine.data_provider_tag(), Some("random"));
        assert_eq!(machine.metadata.build_metadata.model.model_offset, 4);
        assert_eq!(
            machine
                .metadata
                .build_metadata
                .model
                .cross_validation
                .cv_duration_sec,
            Some(12.5)
        );
        assert_eq!(machine.to_string(), "plant-7/compressor-a");
    }
}
