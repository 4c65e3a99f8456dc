use std::sync::Arc;

use fundstore::bootstrap::{BootstrapConfigReader, BootstrapError, BootstrapRecord, BootstrapTask};
use fundstore::config::{BackendKind, Config};
use fundstore::wiring::Environment;
use fundstore_core::{
    Field, FieldType, RecordType, RecordTypeRegistry, SchemaChange, SchemaDiscrepancy,
    SearchOperator, SearchTerm, StorageError, ValidationOptions, Value,
};
use rust_decimal_macros::dec;

fn memory_config() -> Config {
    Config::parse("[database]\nbackend = \"memory\"\n").expect("Failed to parse config")
}

fn sqlite_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.database.backend = BackendKind::Sqlite;
    config.database.url = dir.path().join("funds.db").to_string_lossy().into_owned();
    config
}

fn account_code_registry() -> Arc<RecordTypeRegistry> {
    RecordTypeRegistry::from_types(vec![RecordType::builder("AccountCode")
        .field(Field::required("id", FieldType::Integer))
        .field(Field::required("title", FieldType::String))
        .key("id")
        .build()
        .expect("Failed to build record type")])
    .expect("Failed to seal registry")
}

fn deployed(config: &Config) -> Environment {
    let env = Environment::open(config).expect("Failed to open environment");
    env.deployment().deploy().expect("Failed to deploy schema");
    env
}

#[test]
fn test_fresh_database_validates_after_deploy() {
    let dir = tempfile::tempdir().unwrap();
    for config in [memory_config(), sqlite_config(&dir)] {
        let env = Environment::open_with(&config, account_code_registry()).unwrap();
        let report = env.deployment().deploy().unwrap();
        assert!(report.changes.contains(&SchemaChange::CreatedTable {
            table: "account_code".into()
        }));
        let validation = env.validator(ValidationOptions::default()).validate_schema().unwrap();
        assert!(validation.is_clean());
    }
}

#[test]
fn test_deploy_twice_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(&dir);
    let env = Environment::open_with(&config, account_code_registry()).unwrap();

    let first = env.deployment().deploy().unwrap();
    assert_eq!(
        first.changes,
        vec![SchemaChange::CreatedTable {
            table: "account_code".into()
        }]
    );
    let second = env.deployment().deploy().unwrap();
    assert!(second.is_unchanged());

    // a second environment on the same file sees the same schema
    let reopened = Environment::open_with(&config, account_code_registry()).unwrap();
    assert!(reopened
        .validator(ValidationOptions { flag_extra: true })
        .validate_schema()
        .is_ok());
}

#[test]
fn test_written_record_visible_in_new_transaction() {
    let dir = tempfile::tempdir().unwrap();
    for config in [memory_config(), sqlite_config(&dir)] {
        let env = deployed(&config);
        let store = env.store();

        let mut tx = store.start_transaction().unwrap();
        tx.insert(
            "AccountCode",
            &[("id", Value::Integer(80000)), ("title", Value::from("Operating"))],
        )
        .unwrap();
        tx.commit().unwrap();

        let mut tx = store.start_transaction().unwrap();
        let record = tx.get("AccountCode", &Value::Integer(80000)).unwrap().unwrap();
        assert_eq!(record.get("title"), Some(&Value::from("Operating")));
        tx.rollback().unwrap();
    }
}

#[test]
fn test_bootstrap_unknown_type_writes_nothing() {
    let env = deployed(&memory_config());
    let task = BootstrapTask {
        name: "seed".into(),
        priority: 0,
        records: vec![
            BootstrapRecord::new("account_code").value("id", 1).value("title", "Operating"),
            BootstrapRecord::new("fund").value("id", 1),
        ],
    };

    let err = env.bootstrapper().bootstrap(vec![task]).unwrap_err();
    assert!(matches!(err, BootstrapError::Validation { .. }));

    let mut tx = env.store().start_transaction().unwrap();
    assert!(tx.list("account_code").unwrap().is_empty());
}

#[test]
fn test_missing_table_reported_once() {
    let env = Environment::open_with(&memory_config(), account_code_registry()).unwrap();
    let mut tx = env.store().start_transaction().unwrap();
    tx.backend_mut().create_schema("OAKFUNDS").unwrap();
    tx.commit().unwrap();

    let err = env
        .validator(ValidationOptions::default())
        .validate_schema()
        .unwrap_err();
    match err {
        StorageError::SchemaValidation(report) => {
            assert_eq!(
                report.discrepancies(),
                &[SchemaDiscrepancy::MissingTable {
                    table: "account_code".into()
                }]
            )
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_update_schema_leaves_nothing_remaining() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::open(&sqlite_config(&dir)).unwrap();
    let (report, remaining) = env.deployment().update_schema().unwrap();
    assert!(!report.is_unchanged());
    assert!(remaining.is_clean());
}

#[test]
fn test_bootstrap_file_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let env = deployed(&sqlite_config(&dir));
    let path = dir.path().join("seed.toml");
    std::fs::write(
        &path,
        r#"
        [[task]]
        name = "properties"
        priority = 20

        [[task.record]]
        type = "system_property"
        values = { id = 1, name = "current_year", integer_value = 2024 }

        [[task]]
        name = "accounts"
        priority = 10

        [[task.record]]
        type = "account_code"
        values = { id = 80000, title = "Operating" }

        [[task.record]]
        type = "account"
        values = { id = 1, title = "Checking", default_account_code = 80000 }

        [[task.record]]
        type = "bank_account"
        values = { account = 1, bank_account_type = "checking", interest_rate = 0.025 }
        "#,
    )
    .unwrap();

    let tasks = BootstrapConfigReader::read(&path).unwrap();
    let bootstrapper = env.bootstrapper();
    let summary = bootstrapper.bootstrap(tasks.clone()).unwrap();
    assert_eq!(summary.inserted, 4);

    let rerun = bootstrapper.bootstrap(tasks).unwrap();
    assert_eq!(rerun.inserted, 0);
    assert_eq!(rerun.skipped, 4);

    let mut tx = env.store().start_transaction().unwrap();
    let bank = tx.get("bank_account", &Value::Integer(1)).unwrap().unwrap();
    assert_eq!(bank.get("interest_rate"), Some(&Value::Decimal(dec!(0.025))));
    let property = tx.get("system_property", &Value::Integer(1)).unwrap().unwrap();
    assert_eq!(property.get("boolean_value"), Some(&Value::Null));
}

#[test]
fn test_transactions_numbered_and_searched_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let env = deployed(&sqlite_config(&dir));
    let bootstrap = BootstrapTask {
        name: "accounts".into(),
        priority: 0,
        records: vec![
            BootstrapRecord::new("account_code").value("id", 80000).value("title", "Operating"),
            BootstrapRecord::new("account")
                .value("id", 1)
                .value("title", "Checking")
                .value("default_account_code", 80000),
        ],
    };
    env.bootstrapper().bootstrap(vec![bootstrap]).unwrap();

    let mut tx = env.store().start_transaction().unwrap();
    let mut keys = Vec::new();
    for (date, amount, memo) in [
        ("2024-01-02T00:00:00Z", "1500", Some("opening deposit")),
        ("2024-01-09T00:00:00Z", "-42.10", None),
        ("2024-02-01T00:00:00Z", "250.00", Some("interest")),
    ] {
        let memo = memo.map_or(Value::Null, Value::from);
        let key = tx
            .insert(
                "account_transaction",
                &[
                    ("account", Value::Integer(1)),
                    ("date", Value::from(date)),
                    ("amount", Value::from(amount)),
                    ("memo", memo),
                ],
            )
            .unwrap();
        keys.push(key);
    }
    assert_eq!(keys, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    tx.commit().unwrap();

    let mut tx = env.store().start_transaction().unwrap();
    let january_or_unlabelled = tx
        .search(
            "account_transaction",
            &[
                SearchTerm::equals("account", 1),
                SearchTerm::or([
                    SearchTerm::field("date", SearchOperator::LessThan, "2024-01-05T00:00:00Z"),
                    SearchTerm::equals("memo", Value::Null),
                ]),
            ],
        )
        .unwrap();
    let amounts: Vec<Value> = january_or_unlabelled
        .iter()
        .map(|r| r.get("amount").cloned().unwrap())
        .collect();
    assert_eq!(
        amounts,
        vec![Value::Decimal(dec!(1500)), Value::Decimal(dec!(-42.10))]
    );

    let credits = tx
        .search(
            "account_transaction",
            &[SearchTerm::field("amount", SearchOperator::GreaterThan, 0)],
        )
        .unwrap();
    assert_eq!(credits.len(), 2);
}

#[test]
fn test_unparseable_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fundstore.toml");
    std::fs::write(&path, "[database\nbackend = ").unwrap();
    assert!(matches!(Config::from_file(&path), Err(StorageError::Config(_))));
}
