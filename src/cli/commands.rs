//! CLI command implementations
//!
//! Both commands build an `AttributeIndex`, print a JSON report of its
//! committed state and never touch anything but the named files.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{read_parts, write_parts, write_response};
use super::script::{Script, TransactionMode};
use crate::index::{AttributeIndex, IndexConfig, RecordId, StoragePart};
use crate::observability::{log_event_with_fields, Event, Logger, ObservationScope, Severity};
use crate::transaction::{SequenceIdGenerator, Transaction, TransactionId, TransactionalLayerProducer};

/// Transaction id used for scripted transactions
const REPLAY_TRANSACTION: u64 = 1;

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Replay {
            script,
            config,
            export,
        } => replay(&script, config.as_deref(), export.as_deref()),
        Command::Restore { parts, config } => restore(&parts, config.as_deref()),
    }
}

/// Operation rejected by the index while the replay went on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub index: usize,
    pub op: &'static str,
    pub code: &'static str,
    pub message: String,
}

/// Outcome of a replayed script
#[derive(Debug)]
pub struct Replay {
    pub index: AttributeIndex,
    pub applied: usize,
    pub failures: Vec<OperationFailure>,
}

/// Replay `script_path` and print the report
pub fn replay(script_path: &Path, config_path: Option<&Path>, export: Option<&Path>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let script = Script::load(script_path)?;
    let replay = run_script(&script, config)?;

    let mut report = report(&replay.index, script.container)?;
    report["applied"] = json!(replay.applied);
    report["failures"] = serde_json::to_value(&replay.failures)?;

    if let Some(path) = export {
        let parts = replay.index.modified_storage_parts(script.container);
        write_parts(path, &parts)?;
    }
    write_response(report)
}

/// Rebuild an index from exported parts and print the report
pub fn restore(parts_path: &Path, config_path: Option<&Path>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let path = parts_path.display().to_string();
    let scope = ObservationScope::with_fields("STORAGE_RESTORE", &[("path", &path)]);

    let parts = read_parts(parts_path)?;
    let container = container_of(&parts)?;
    let index = match AttributeIndex::from_storage_parts(
        Arc::new(SequenceIdGenerator::new()),
        config,
        parts,
    ) {
        Ok(index) => index,
        Err(e) => {
            scope.fail(Severity::Error, &e.to_string());
            return Err(e.into());
        }
    };
    scope.complete();

    write_response(report(&index, container)?)
}

/// Configuration from `path`, or the defaults
pub fn load_config(path: Option<&Path>) -> CliResult<IndexConfig> {
    let config = match path {
        Some(path) => {
            let config = IndexConfig::load(path)?;
            log_event_with_fields(Event::ConfigLoaded, &[("path", &path.display().to_string())]);
            config
        }
        None => IndexConfig::default(),
    };
    Logger::set_min_severity(config.severity());
    Ok(config)
}

fn container_of(parts: &[StoragePart]) -> CliResult<u32> {
    let container = parts.first().map_or(0, |part| part.container);
    if parts.iter().any(|part| part.container != container) {
        return Err(CliError::script_error(
            "Storage parts belong to more than one container",
        ));
    }
    Ok(container)
}

/// Apply every operation of `script` to a fresh index.
///
/// Operations rejected by the index are recorded and skipped; a fatal
/// index error aborts the replay.
pub fn run_script(script: &Script, config: IndexConfig) -> CliResult<Replay> {
    let mut index = AttributeIndex::new(Arc::new(SequenceIdGenerator::new()), config);
    let mut failures = Vec::new();
    let mut applied = 0;
    log_event_with_fields(
        Event::ReplayBegin,
        &[
            ("operations", &script.operations.len().to_string()),
            ("transaction", transaction_label(script.transaction)),
        ],
    );

    let mut tx = match script.transaction {
        TransactionMode::None => None,
        TransactionMode::Commit | TransactionMode::Rollback => {
            Some(Transaction::new(TransactionId::new(REPLAY_TRANSACTION)))
        }
    };

    for (i, op) in script.operations.iter().enumerate() {
        let result = match tx.as_mut() {
            Some(tx) => script.apply(op, &mut index.write_in(tx)),
            None => script.apply(op, &mut index.write()),
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => failures.push(OperationFailure {
                index: i,
                op: op.name(),
                code: e.code(),
                message: e.to_string(),
            }),
        }
    }

    if let Some(mut tx) = tx {
        match script.transaction {
            TransactionMode::Rollback => index.discard(&mut tx),
            _ => index = index.commit(&mut tx)?,
        }
    }

    log_event_with_fields(
        Event::ReplayComplete,
        &[
            ("applied", &applied.to_string()),
            ("failed", &failures.len().to_string()),
        ],
    );
    Ok(Replay {
        index,
        applied,
        failures,
    })
}

fn transaction_label(mode: TransactionMode) -> &'static str {
    match mode {
        TransactionMode::None => "none",
        TransactionMode::Commit => "commit",
        TransactionMode::Rollback => "rollback",
    }
}

/// JSON report of the committed state of `index`
pub fn report(index: &AttributeIndex, container: u32) -> CliResult<Value> {
    let view = index.read(None);

    let mut chains = serde_json::Map::new();
    for key in view.chain_keys() {
        if let Some(chain) = view.chain_index_by_key(&key) {
            let consistency = chain.consistency_report();
            chains.insert(
                key.to_string(),
                json!({
                    "order": chain.resolve(),
                    "fragments": chain.fragments().len(),
                    "state": consistency.state,
                }),
            );
        }
    }

    let mut sorts = serde_json::Map::new();
    for key in view.sort_keys() {
        if let Some(sort) = view.sort_index_by_key(&key) {
            sorts.insert(key.to_string(), json!(sort.sorted_records()));
        }
    }

    let mut filters = serde_json::Map::new();
    for key in view.filter_keys() {
        if let Some(filter) = view.filter_index_by_key(&key) {
            let records: Vec<RecordId> = filter.all_records().to_vec();
            filters.insert(
                key.to_string(),
                json!({ "values": filter.size(), "records": records }),
            );
        }
    }

    let mut uniques = serde_json::Map::new();
    for key in view.unique_keys() {
        if let Some(unique) = view.unique_index_by_key(&key) {
            uniques.insert(key.to_string(), json!(unique.size()));
        }
    }

    let dirty = dirty_parts(index, container)?;

    let metrics = index.metrics().snapshot();
    Ok(json!({
        "chains": chains,
        "sorts": sorts,
        "filters": filters,
        "uniques": uniques,
        "storage_parts": dirty,
        "metrics": {
            "layers_created": metrics.layers_created,
            "commits": metrics.commits,
            "rollbacks": metrics.rollbacks,
            "storage_parts_exported": metrics.storage_parts_exported,
            "unique_violations": metrics.unique_violations,
            "inconsistent_chains": metrics.inconsistent_chains,
        },
    }))
}

/// Kind, attribute and checksum of every dirty part, without exporting it
fn dirty_parts(index: &AttributeIndex, container: u32) -> CliResult<Vec<Value>> {
    let mut parts = Vec::new();
    for part in index.dirty_storage_parts(container) {
        parts.push(json!({
            "kind": part.kind(),
            "attribute": part.attribute.to_string(),
            "checksum": part.checksum()?,
        }));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(json: &str) -> Script {
        Script::parse(json).unwrap()
    }

    const CHAIN_SCRIPT: &str = r#"{
        "container": 4,
        "transaction": "commit",
        "attributes": [
            { "name": "order", "type": "int" },
            { "name": "code", "type": "string" }
        ],
        "operations": [
            { "op": "insert_chain", "attribute": "order", "predecessor": 3, "record": 2 },
            { "op": "insert_chain", "attribute": "order", "predecessor": null, "record": 3 },
            { "op": "insert_chain", "attribute": "order", "predecessor": 2, "record": 1 },
            { "op": "insert_unique", "attribute": "code", "value": { "string": "A" }, "record": 1 },
            { "op": "insert_unique", "attribute": "code", "value": { "string": "A" }, "record": 2 }
        ]
    }"#;

    #[test]
    fn test_replay_commit() {
        let replay = run_script(&script(CHAIN_SCRIPT), IndexConfig::default()).unwrap();
        assert_eq!(replay.applied, 4);
        assert_eq!(replay.failures.len(), 1);
        assert_eq!(replay.failures[0].index, 4);
        assert_eq!(replay.failures[0].code, "IDX_UNIQUE_VALUE_VIOLATION");

        let report = report(&replay.index, 4).unwrap();
        assert_eq!(report["chains"]["order"]["order"], json!([3, 2, 1]));
        assert_eq!(report["chains"]["order"]["state"], json!("consistent"));
        assert_eq!(report["uniques"]["code"], json!(1));
        assert_eq!(report["storage_parts"].as_array().unwrap().len(), 2);
        assert_eq!(report["metrics"]["commits"], json!(1));
        assert_eq!(report["metrics"]["unique_violations"], json!(1));
    }

    #[test]
    fn test_replay_rollback_leaves_index_empty() {
        let json = CHAIN_SCRIPT.replace("\"commit\"", "\"rollback\"");
        let replay = run_script(&script(&json), IndexConfig::default()).unwrap();
        assert!(replay.index.read(None).is_empty());
        assert_eq!(replay.index.metrics().snapshot().rollbacks, 1);

        let report = report(&replay.index, 4).unwrap();
        assert!(report["storage_parts"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_replay_direct() {
        let replay = run_script(
            &script(
                r#"{
                    "attributes": [{ "name": "age", "type": "int" }],
                    "operations": [
                        { "op": "insert_sort", "attribute": "age", "value": { "int": 30 }, "record": 1 },
                        { "op": "insert_sort", "attribute": "age", "value": { "int": 20 }, "record": 2 },
                        { "op": "remove_sort", "attribute": "age", "value": { "int": 99 }, "record": 3 }
                    ]
                }"#,
            ),
            IndexConfig::default(),
        )
        .unwrap();
        assert_eq!(replay.applied, 2);
        assert_eq!(replay.failures[0].op, "remove_sort");

        let report = report(&replay.index, 0).unwrap();
        assert_eq!(report["sorts"]["age"], json!([2, 1]));
        assert_eq!(report["metrics"]["layers_created"], json!(0));
    }

    #[test]
    fn test_export_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("script.json");
        let parts_path = dir.path().join("parts.jsonl");
        std::fs::write(&script_path, CHAIN_SCRIPT).unwrap();

        replay(&script_path, None, Some(&parts_path)).unwrap();
        let parts = read_parts(&parts_path).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|part| part.container == 4));

        let index = AttributeIndex::from_storage_parts(
            Arc::new(SequenceIdGenerator::new()),
            IndexConfig::default(),
            parts,
        )
        .unwrap();
        let report = report(&index, 4).unwrap();
        assert_eq!(report["chains"]["order"]["order"], json!([3, 2, 1]));
        assert!(report["storage_parts"].as_array().unwrap().is_empty());

        restore(&parts_path, None).unwrap();
    }

    #[test]
    fn test_mixed_containers_rejected() {
        let part = |container| {
            StoragePart::from_json(&format!(
                r#"{{"container":{},"attribute":{{"name":"order"}},"payload":{{"kind":"chain","data":{{"elements":[],"fragments":[]}}}}}}"#,
                container
            ))
            .unwrap()
        };
        assert!(container_of(&[part(1), part(1)]).is_ok());
        assert!(container_of(&[part(1), part(2)]).is_err());
        assert_eq!(container_of(&[]).unwrap(), 0);
    }

    #[test]
    fn test_config_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, r#"{ "verify_chains_on_commit": true }"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(config.verify_chains_on_commit);
        assert!(config.memoize_resolved_order);

        std::fs::write(&path, r#"{ "log_level": "loud" }"#).unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert_eq!(err.code_str(), "IDX_CLI_CONFIG_ERROR");
    }
}
