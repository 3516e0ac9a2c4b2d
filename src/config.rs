//! CLI surface (`RouterOptions`, parsed with `structopt`) and the
//! hot-reloadable `DynamicConfig` JSON schema, converted into the
//! internal `RouterConfig`/`DiscoverySpec`/`PolicySpec` types that the
//! rest of the crate builds providers and policies from.
//!
//! A thin CLI struct with no business logic, typed validation errors,
//! and a `load()` entry point for the JSON file, plus a content-hash
//! helper the dynamic-config watcher uses to detect changes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use structopt::StructOpt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("static-backends and static-models must have equal length ({0} vs {1})")]
    MismatchedStaticLists(usize, usize),
    #[error("static-model-types length ({0}) does not match static-backends length ({1})")]
    MismatchedModelTypes(usize, usize),
    #[error("invalid service-discovery mode {0}")]
    UnknownServiceDiscovery(String),
    #[error("invalid routing-logic {0}")]
    UnknownRoutingLogic(String),
    #[error("service-discovery=static requires --static-backends and --static-models")]
    MissingStaticBackends,
    #[error("service-discovery=cluster requires --k8s-namespace and --k8s-label-selector")]
    MissingClusterFields,
    #[error("routing-logic=session requires --session-key")]
    MissingSessionKey,
    #[error("routing-logic=disaggregated_prefill requires --prefill-model-label and --decode-model-label")]
    MissingDisaggregationLabels,
    #[error("invalid model type {0}")]
    UnknownModelType(String),
    #[error("could not parse backend label {0}, expected key=value")]
    MalformedLabel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceDiscoveryMode {
    Static,
    Cluster,
}

impl FromStr for ServiceDiscoveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(ServiceDiscoveryMode::Static),
            "cluster" => Ok(ServiceDiscoveryMode::Cluster),
            other => Err(Error::UnknownServiceDiscovery(other.to_string())),
        }
    }
}

impl fmt::Display for ServiceDiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceDiscoveryMode::Static => "static",
            ServiceDiscoveryMode::Cluster => "cluster",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingLogic {
    RoundRobin,
    Session,
    LeastLoaded,
    Prefix,
    DisaggregatedPrefill,
}

impl FromStr for RoutingLogic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roundrobin" => Ok(RoutingLogic::RoundRobin),
            "session" => Ok(RoutingLogic::Session),
            "least_loaded" => Ok(RoutingLogic::LeastLoaded),
            "prefix" => Ok(RoutingLogic::Prefix),
            "disaggregated_prefill" => Ok(RoutingLogic::DisaggregatedPrefill),
            other => Err(Error::UnknownRoutingLogic(other.to_string())),
        }
    }
}

impl fmt::Display for RoutingLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingLogic::RoundRobin => "roundrobin",
            RoutingLogic::Session => "session",
            RoutingLogic::LeastLoaded => "least_loaded",
            RoutingLogic::Prefix => "prefix",
            RoutingLogic::DisaggregatedPrefill => "disaggregated_prefill",
        };
        write!(f, "{}", s)
    }
}

/// The external launcher's surface, accepted as-is by the core per
/// the CLI contract. No business logic lives here: `into_router_config`
/// is the only place validation happens.
#[derive(StructOpt, Debug, Clone)]
#[structopt(name = "llm-router")]
pub struct RouterOptions {
    #[structopt(long, default_value = "0.0.0.0")]
    pub host: String,

    #[structopt(long, default_value = "8080")]
    pub port: u16,

    #[structopt(long, default_value = "static")]
    pub service_discovery: String,

    #[structopt(long, use_delimiter = true)]
    pub static_backends: Vec<String>,

    #[structopt(long, use_delimiter = true)]
    pub static_models: Vec<String>,

    #[structopt(long, use_delimiter = true)]
    pub static_model_types: Vec<String>,

    /// Each entry is `key=value[,key2=value2]`, one per backend, aligned
    /// positionally with `static_backends`.
    #[structopt(long, use_delimiter = true, value_delimiter = ";")]
    pub static_model_labels: Vec<String>,

    #[structopt(long, default_value = "8000")]
    pub k8s_port: u16,

    #[structopt(long, default_value = "default")]
    pub k8s_namespace: String,

    #[structopt(long, default_value = "")]
    pub k8s_label_selector: String,

    #[structopt(long, default_value = "roundrobin")]
    pub routing_logic: String,

    #[structopt(long, default_value = "")]
    pub session_key: String,

    #[structopt(long, default_value = "")]
    pub prefill_model_label: String,

    #[structopt(long, default_value = "")]
    pub decode_model_label: String,

    #[structopt(long, default_value = "30")]
    pub engine_stats_interval: u64,

    #[structopt(long, default_value = "60")]
    pub request_stats_window: u64,

    #[structopt(long)]
    pub log_stats: bool,

    #[structopt(long, default_value = "30")]
    pub log_stats_interval: u64,

    #[structopt(long, parse(from_os_str))]
    pub dynamic_config_json: Option<PathBuf>,

    /// Run the tokio runtime multi-threaded (default) or single-threaded.
    #[structopt(long)]
    pub threaded: bool,

    /// Forwarded verbatim to the pre-processor chain, one name per
    /// `--feature-gate`; this crate does not interpret them.
    #[structopt(long, use_delimiter = true)]
    pub feature_gate: Vec<String>,

    /// Max concurrent in-flight connections the proxy will hold open to
    /// any single backend.
    #[structopt(long, default_value = "256")]
    pub max_connections_per_backend: usize,
}

impl RouterOptions {
    pub fn into_router_config(self) -> Result<RouterConfig, Error> {
        let discovery_mode: ServiceDiscoveryMode = self.service_discovery.parse()?;
        let routing_logic: RoutingLogic = self.routing_logic.parse()?;

        let discovery = build_discovery_spec(
            discovery_mode,
            &self.static_backends,
            &self.static_models,
            &self.static_model_types,
            &self.static_model_labels,
            self.k8s_port,
            &self.k8s_namespace,
            &self.k8s_label_selector,
        )?;

        let policy = build_policy_spec(
            routing_logic,
            &self.session_key,
            &self.prefill_model_label,
            &self.decode_model_label,
        )?;

        Ok(RouterConfig {
            host: self.host,
            port: self.port,
            discovery,
            policy,
            engine_stats_interval: Duration::from_secs(self.engine_stats_interval),
            request_stats_window: self.request_stats_window,
            log_stats: self.log_stats,
            log_stats_interval: Duration::from_secs(self.log_stats_interval),
            dynamic_config_path: self.dynamic_config_json,
            feature_gates: self.feature_gate,
            max_connections_per_backend: self.max_connections_per_backend,
        })
    }
}

/// One statically-configured backend, positionally assembled from the
/// CLI's parallel comma-separated lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendSpec {
    pub url: String,
    pub model: String,
    pub model_type: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiscoverySpec {
    Static { backends: Vec<BackendSpec> },
    Cluster {
        port: u16,
        namespace: String,
        label_selector: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "logic", rename_all = "snake_case")]
pub enum PolicySpec {
    RoundRobin,
    Session { session_key: String },
    LeastLoaded,
    Prefix,
    DisaggregatedPrefill {
        prefill_model_label: String,
        decode_model_label: String,
    },
}

/// The validated, internally-consistent combination the rest of the
/// crate is built from: one discovery spec, one policy spec, plus the
/// scalar knobs that don't need their own types.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub discovery: DiscoverySpec,
    pub policy: PolicySpec,
    pub engine_stats_interval: Duration,
    pub request_stats_window: u64,
    pub log_stats: bool,
    pub log_stats_interval: Duration,
    pub dynamic_config_path: Option<PathBuf>,
    pub feature_gates: Vec<String>,
    pub max_connections_per_backend: usize,
}

fn parse_labels(spec: &str) -> Result<HashMap<String, String>, Error> {
    let mut out = HashMap::new();
    if spec.is_empty() {
        return Ok(out);
    }
    for pair in spec.split(',') {
        let mut parts = pair.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if !k.is_empty() => {
                out.insert(k.to_string(), v.to_string());
            }
            _ => return Err(Error::MalformedLabel(pair.to_string())),
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn build_discovery_spec(
    mode: ServiceDiscoveryMode,
    backends: &[String],
    models: &[String],
    model_types: &[String],
    model_labels: &[String],
    k8s_port: u16,
    k8s_namespace: &str,
    k8s_label_selector: &str,
) -> Result<DiscoverySpec, Error> {
    match mode {
        ServiceDiscoveryMode::Static => {
            if backends.is_empty() || models.is_empty() {
                return Err(Error::MissingStaticBackends);
            }
            if backends.len() != models.len() {
                return Err(Error::MismatchedStaticLists(backends.len(), models.len()));
            }
            if !model_types.is_empty() && model_types.len() != backends.len() {
                return Err(Error::MismatchedModelTypes(model_types.len(), backends.len()));
            }
            let mut specs = Vec::with_capacity(backends.len());
            for (i, (url, model)) in backends.iter().zip(models.iter()).enumerate() {
                let model_type = model_types
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| "chat".to_string());
                crate::registry::ModelType::from_str(&model_type)
                    .map_err(|_| Error::UnknownModelType(model_type.clone()))?;
                let labels = model_labels.get(i).map(|s| s.as_str()).unwrap_or("");
                specs.push(BackendSpec {
                    url: url.clone(),
                    model: model.clone(),
                    model_type,
                    labels: parse_labels(labels)?,
                });
            }
            Ok(DiscoverySpec::Static { backends: specs })
        }
        ServiceDiscoveryMode::Cluster => {
            if k8s_namespace.is_empty() || k8s_label_selector.is_empty() {
                return Err(Error::MissingClusterFields);
            }
            Ok(DiscoverySpec::Cluster {
                port: k8s_port,
                namespace: k8s_namespace.to_string(),
                label_selector: k8s_label_selector.to_string(),
            })
        }
    }
}

fn build_policy_spec(
    logic: RoutingLogic,
    session_key: &str,
    prefill_label: &str,
    decode_label: &str,
) -> Result<PolicySpec, Error> {
    match logic {
        RoutingLogic::RoundRobin => Ok(PolicySpec::RoundRobin),
        RoutingLogic::Session => {
            if session_key.is_empty() {
                return Err(Error::MissingSessionKey);
            }
            Ok(PolicySpec::Session {
                session_key: session_key.to_string(),
            })
        }
        RoutingLogic::LeastLoaded => Ok(PolicySpec::LeastLoaded),
        RoutingLogic::Prefix => Ok(PolicySpec::Prefix),
        RoutingLogic::DisaggregatedPrefill => {
            if prefill_label.is_empty() || decode_label.is_empty() {
                return Err(Error::MissingDisaggregationLabels);
            }
            Ok(PolicySpec::DisaggregatedPrefill {
                prefill_model_label: prefill_label.to_string(),
                decode_model_label: decode_label.to_string(),
            })
        }
    }
}

/// The hot-reloadable JSON file's exact shape: a subset of
/// `RouterConfig` that the watcher may swap at runtime. Scalar knobs
/// like ports and stats intervals are CLI-only and not reloadable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DynamicConfig {
    pub service_discovery: String,
    pub routing_logic: String,
    #[serde(default)]
    pub static_backends: Vec<String>,
    #[serde(default)]
    pub static_models: Vec<String>,
    #[serde(default)]
    pub static_model_types: Vec<String>,
    #[serde(default)]
    pub static_model_labels: Vec<String>,
    #[serde(default)]
    pub session_key: String,
    #[serde(default = "default_k8s_port")]
    pub k8s_port: u16,
    #[serde(default)]
    pub k8s_namespace: String,
    #[serde(default)]
    pub k8s_label_selector: String,
    #[serde(default)]
    pub prefill_model_label: String,
    #[serde(default)]
    pub decode_model_label: String,
}

fn default_k8s_port() -> u16 {
    8000
}

impl DynamicConfig {
    /// Validate and lower into the same `(DiscoverySpec, PolicySpec)`
    /// pair the CLI path produces, so the watcher and the startup path
    /// share one notion of "valid".
    pub fn resolve(&self) -> Result<(DiscoverySpec, PolicySpec), Error> {
        let mode: ServiceDiscoveryMode = self.service_discovery.parse()?;
        let logic: RoutingLogic = self.routing_logic.parse()?;
        let discovery = build_discovery_spec(
            mode,
            &self.static_backends,
            &self.static_models,
            &self.static_model_types,
            &self.static_model_labels,
            self.k8s_port,
            &self.k8s_namespace,
            &self.k8s_label_selector,
        )?;
        let policy = build_policy_spec(
            logic,
            &self.session_key,
            &self.prefill_model_label,
            &self.decode_model_label,
        )?;
        Ok((discovery, policy))
    }
}

/// Read and validate a dynamic-config file from disk. Used both at
/// startup (when `--dynamic-config-json` is given) and by the watcher
/// on every poll.
pub fn load_dynamic_config(path: &std::path::Path) -> anyhow::Result<DynamicConfig> {
    let input = std::fs::read_to_string(path)?;
    let config: DynamicConfig = serde_json::from_str(&input)?;
    config.resolve()?;
    Ok(config)
}

/// SHA-256 of a dynamic-config file's raw bytes, used by the watcher
/// to skip re-parsing and re-validating an unchanged file.
pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
