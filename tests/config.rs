mod common;

use std::time::Duration;

use assert_matches::assert_matches;

use cmip_harvest::config::{Config, ConfigLoader, NetworkEntry, SelectionEntry};
use cmip_harvest::error::HarvestError;

use common::temp_root;

#[test]
fn json_file_overrides_defaults() {
    let (_temp, root) = temp_root();
    let path = root.join("cmip-harvest.json");
    std::fs::write(
        path.as_std_path(),
        r#"{
            "schema_version": 1,
            "workspace": "/data/cmip6",
            "experiments": ["piControl", "abrupt-4xCO2", " "],
            "index_nodes": ["esgf.example.org", "https://mirror.example.org/esg-search/"],
            "selection": { "required_variables": ["tas"] },
            "network": { "retry_attempts": 5, "retry_delay_ms": 250, "page_size": 100 }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.as_str())).unwrap();

    assert_eq!(resolved.workspace, "/data/cmip6");
    assert_eq!(resolved.experiments, vec!["piControl", "abrupt-4xCO2"]);
    assert_eq!(resolved.variables.len(), 5);
    assert_eq!(
        resolved.index_nodes,
        vec![
            "https://esgf.example.org/esg-search",
            "https://mirror.example.org/esg-search"
        ]
    );
    assert_eq!(resolved.selection.baseline_experiment, "piControl");
    assert_eq!(resolved.selection.required_variables.len(), 1);
    assert_eq!(resolved.network.retry.max_attempts, 5);
    assert_eq!(resolved.network.retry.delay, Duration::from_millis(250));
    assert_eq!(resolved.network.page_size, 100);
    assert_eq!(resolved.network.search_workers, 10);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let (_temp, root) = temp_root();
    let missing = root.join("nope.json");
    assert_matches!(
        ConfigLoader::resolve(Some(missing.as_str())),
        Err(HarvestError::ConfigRead(_))
    );
}

#[test]
fn malformed_json_is_reported() {
    let (_temp, root) = temp_root();
    let path = root.join("broken.json");
    std::fs::write(path.as_std_path(), "{ \"experiments\": [").unwrap();
    assert_matches!(
        ConfigLoader::resolve(Some(path.as_str())),
        Err(HarvestError::ConfigParse(_))
    );
}

#[test]
fn zero_budgets_are_rejected() {
    let config = Config {
        network: Some(NetworkEntry {
            retry_attempts: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::InvalidConfig(message)) if message.contains("retry_attempts")
    );

    let config = Config {
        variables: Some(vec![]),
        ..Default::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::InvalidConfig(_))
    );
}

#[test]
fn selection_defaults_fill_gaps() {
    let config = Config {
        selection: Some(SelectionEntry {
            forced_experiment: Some("1pctCO2".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.selection.baseline_experiment, "piControl");
    assert_eq!(resolved.selection.forced_experiment, "1pctCO2");
    assert_eq!(resolved.selection.required_variables.len(), 4);
}
