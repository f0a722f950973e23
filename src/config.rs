use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::retry::RetryPolicy;
use crate::select::SelectionPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "cmip-harvest.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub experiments: Option<Vec<String>>,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub index_nodes: Option<Vec<String>>,
    #[serde(default)]
    pub selection: Option<SelectionEntry>,
    #[serde(default)]
    pub network: Option<NetworkEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SelectionEntry {
    #[serde(default)]
    pub baseline_experiment: Option<String>,
    #[serde(default)]
    pub forced_experiment: Option<String>,
    #[serde(default)]
    pub required_variables: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NetworkEntry {
    #[serde(default)]
    pub search_workers: Option<usize>,
    #[serde(default)]
    pub retry_attempts: Option<usize>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub transfer_timeout_secs: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub search_workers: usize,
    pub retry: RetryPolicy,
    /// Connect timeout for every call, and total timeout for search requests.
    pub timeout: Duration,
    /// Total timeout for one payload transfer.
    pub transfer_timeout: Duration,
    pub page_size: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub workspace: Utf8PathBuf,
    pub experiments: Vec<String>,
    pub variables: Vec<String>,
    pub index_nodes: Vec<String>,
    pub selection: SelectionPolicy,
    pub network: NetworkSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `cmip-harvest.json` in the working directory. Without
    /// an explicit path a missing default file resolves to built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let workspace = Utf8PathBuf::from(config.workspace.unwrap_or_else(|| ".".to_string()));

        let experiments = non_empty("experiments", config.experiments, default_experiments)?;
        let variables = non_empty("variables", config.variables, default_variables)?;
        let index_nodes = non_empty("index_nodes", config.index_nodes, default_index_nodes)?
            .iter()
            .map(|node| expand_index_node(node))
            .collect();

        let selection = config.selection.unwrap_or_default();
        let defaults = SelectionPolicy::default();
        let selection = SelectionPolicy {
            baseline_experiment: selection
                .baseline_experiment
                .unwrap_or(defaults.baseline_experiment),
            forced_experiment: selection
                .forced_experiment
                .unwrap_or(defaults.forced_experiment),
            required_variables: selection
                .required_variables
                .map(|vars| vars.into_iter().collect::<BTreeSet<_>>())
                .unwrap_or(defaults.required_variables),
        };

        let network = config.network.unwrap_or_default();
        let search_workers = network.search_workers.unwrap_or(10);
        if search_workers == 0 {
            return Err(HarvestError::InvalidConfig(
                "network.search_workers must be at least 1".to_string(),
            ));
        }
        let retry_attempts = network.retry_attempts.unwrap_or(3);
        if retry_attempts == 0 {
            return Err(HarvestError::InvalidConfig(
                "network.retry_attempts must be at least 1".to_string(),
            ));
        }
        let page_size = network.page_size.unwrap_or(500);
        if page_size == 0 {
            return Err(HarvestError::InvalidConfig(
                "network.page_size must be at least 1".to_string(),
            ));
        }
        let network = NetworkSettings {
            search_workers,
            retry: RetryPolicy::new(
                retry_attempts,
                Duration::from_millis(network.retry_delay_ms.unwrap_or(2000)),
            ),
            timeout: Duration::from_secs(network.timeout_secs.unwrap_or(30)),
            transfer_timeout: Duration::from_secs(network.transfer_timeout_secs.unwrap_or(3600)),
            page_size,
        };

        Ok(ResolvedConfig {
            schema_version,
            workspace,
            experiments,
            variables,
            index_nodes,
            selection,
            network,
        })
    }
}

fn non_empty(
    field: &str,
    value: Option<Vec<String>>,
    default: fn() -> Vec<String>,
) -> Result<Vec<String>, HarvestError> {
    let values = value.unwrap_or_else(default);
    if values.iter().all(|value| value.trim().is_empty()) {
        return Err(HarvestError::InvalidConfig(format!("{field} must not be empty")));
    }
    Ok(values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect())
}

/// Bare host names become `https://<host>/esg-search`.
pub fn expand_index_node(node: &str) -> String {
    let node = node.trim().trim_end_matches('/');
    if node.starts_with("http://") || node.starts_with("https://") {
        node.to_string()
    } else {
        format!("https://{node}/esg-search")
    }
}

pub fn default_experiments() -> Vec<String> {
    [
        "piControl",
        "abrupt-4xCO2",
        "1pctCO2",
        "historical",
        "ssp119",
        "ssp245",
        "ssp370",
        "ssp460",
        "ssp585",
        "esm-piControl",
        "esm-hist",
        "esm-ssp585",
        "esm-1pctCO2",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

pub fn default_variables() -> Vec<String> {
    ["areacella", "tas", "rsdt", "rsut", "rlut"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn default_index_nodes() -> Vec<String> {
    [
        "esgf-node.llnl.gov",
        "esgf-data.dkrz.de",
        "esgf-index1.ceda.ac.uk",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
