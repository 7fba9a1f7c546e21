use std::collections::HashMap;

use serde::Deserialize;

use crate::common::error::RunnerError;
use crate::common::format::parse_bytes;
use crate::resources::ResourceAsk;
use crate::storage::ArtifactRef;

/// The experiment description pulled off a queue.  Field names follow the
/// studioml client payload; everything the runner does not consume is
/// ignored during decoding.  Immutable once constructed.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub config: Config,
    pub experiment: Experiment,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: Database,
    /// Environment bag exported into the experiment script.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pip: Vec<String>,
    #[serde(default)]
    pub resource: ResourceSpec,
    /// Checkpoint interval in minutes; outside [1, 43800] checkpointing is
    /// disabled.
    #[serde(default, rename = "saveWorkspaceFrequency")]
    pub save_workspace_frequency: i64,
    #[serde(default)]
    pub runner: RunnerOpts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Database {
    #[serde(default, rename = "projectId")]
    pub project_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerOpts {
    #[serde(default, rename = "slackDest")]
    pub slack_dest: String,
}

/// Resource quantities as the client sends them, sizes with SI/IEC units.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub ram: String,
    #[serde(default)]
    pub hdd: String,
    #[serde(default, rename = "gpuMem")]
    pub gpu_mem: String,
}

impl ResourceSpec {
    pub fn to_ask(&self) -> crate::Result<ResourceAsk> {
        Ok(ResourceAsk {
            cpus: self.cpus,
            gpus: self.gpus,
            ram: parse_size(&self.ram)?,
            disk: parse_size(&self.hdd)?,
            gpu_mem: parse_size(&self.gpu_mem)?,
        })
    }
}

fn parse_size(value: &str) -> crate::Result<u64> {
    if value.is_empty() {
        return Ok(0);
    }
    parse_bytes(value)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Experiment {
    pub key: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub artifacts: HashMap<String, ArtifactRef>,
    #[serde(default)]
    pub pythonenv: Vec<String>,
}

impl Request {
    pub fn unmarshal(payload: &[u8]) -> crate::Result<Request> {
        serde_json::from_slice(payload).map_err(|e| RunnerError::PoisonMessage(e.to_string()))
    }

    pub fn resource_ask(&self) -> crate::Result<ResourceAsk> {
        self.config.resource.to_ask()
    }

    /// Artifact groups that are returned to storage, keyed by group name.
    pub fn mutable_artifacts(&self) -> impl Iterator<Item = (&String, &ArtifactRef)> {
        self.experiment
            .artifacts
            .iter()
            .filter(|(_, artifact)| artifact.mutable)
    }
}
