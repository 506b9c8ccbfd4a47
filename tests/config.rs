mod common;

use common::*;
use serde_json::json;
use stableflow::config::{load_path, load_value, Override};

#[test]
fn override_replaces_host_account() {
    let doc = single_process_doc(10);
    let over = Override::parse("host.localhost.acct_run=bob").unwrap();
    let system = load_value(doc, &[over], None).unwrap();
    assert_eq!(system.host("localhost").unwrap().acct_run, "bob");
}

#[test]
fn sequence_override_materializes_missing_containers() {
    // `node` is a sequence; position 0 gains `cfg.port` through the
    // override even though `cfg` was absent.
    let doc = single_process_doc(10);
    let over = Override::parse("node.0.cfg.port=9000").unwrap();
    let system = load_value(doc, &[over], None).unwrap();
    assert_eq!(system.node("src").unwrap().cfg["port"], json!(9000));
}

#[test]
fn overrides_apply_in_order() {
    let doc = single_process_doc(10);
    let overs = vec![
        Override::parse("host.localhost.acct_run=first").unwrap(),
        Override::parse("host.localhost.acct_run=second").unwrap(),
    ];
    let system = load_value(doc, &overs, None).unwrap();
    assert_eq!(system.host("localhost").unwrap().acct_run, "second");
}

#[test]
fn document_file_round_trips() {
    let doc = single_process_doc(25);
    let file = write_doc(&doc);
    let system = load_path(file.path(), &[], None).unwrap();
    assert_eq!(system.id_system, "itest");
    assert_eq!(system.tick_period, std::time::Duration::from_millis(25));
}

#[test]
fn unreadable_document_is_a_config_error() {
    let err = load_path(std::path::Path::new("/no/such/stableflow.json"), &[], None).unwrap_err();
    assert!(err.reason().contains("cannot read"));
}

#[test]
fn malformed_json_is_a_config_error() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"{not json").unwrap();
    let err = load_path(file.path(), &[], None).unwrap_err();
    assert_eq!(err.path(), "document");
}

#[test]
fn probe_components_resolve_through_the_registry() {
    let (registry, _probes) = probe_registry();
    let doc = single_process_doc(10);
    assert!(load_value(doc, &[], Some(&registry)).is_ok());
}

#[test]
fn tick_budget_and_error_sink_denormalize() {
    let mut doc = single_process_doc(10);
    doc["system"]["tick_budget_ms"] = json!(250);
    doc["system"]["error_sink"] = json!("/tmp/stableflow-errors.jsonl");
    let system = load_value(doc, &[], None).unwrap();
    assert_eq!(
        system.tick_budget,
        Some(std::time::Duration::from_millis(250))
    );
    assert_eq!(
        system.error_sink,
        stableflow::error::ErrorSink::File("/tmp/stableflow-errors.jsonl".into())
    );
}
