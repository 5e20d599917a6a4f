//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration and validation tests for the emeter stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use emeter_common::{AppConfig, ReportZone};

fn repo_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

fn read(path: &str) -> String {
    let full = repo_path(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn reference_config_parses_and_validates() {
    let config: AppConfig = read("configs/emeterd.toml")
        .parse()
        .expect("reference configuration should parse");
    assert_eq!(config.broker.port, 1883);
    assert_eq!(config.broker.client_id, "Compute_Usage");
    assert_eq!(config.meter.power_topic, "emon/emonesp/W");
    assert_eq!(config.meter.timezone, ReportZone::Local);
    assert!(!config.metrics.enabled);
}

#[test]
fn reference_config_keeps_credentials_out_of_the_file() {
    let config: AppConfig = read("configs/emeterd.toml").parse().unwrap();
    assert!(config.broker.username.is_none());
    assert!(config.broker.password.is_none());
    let err = config.broker.require_session().unwrap_err().to_string();
    assert!(err.contains("-u user"), "diagnostic should name the flags: {err}");
}

#[test]
fn loader_prefers_first_existing_candidate() {
    let loaded = AppConfig::load_with_source(&[
        repo_path("configs/does-not-exist.toml"),
        repo_path("configs/emeterd.toml"),
    ])
    .unwrap();
    let source = loaded.source.expect("a candidate should have been used");
    assert!(source.ends_with("configs/emeterd.toml"));
}
