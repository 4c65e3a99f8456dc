use std::{collections::BTreeMap, path::Path, str::FromStr};

use fundstore_core::Value;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{BootstrapError, BootstrapRecord, BootstrapTask};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, bound(deserialize = "V: Deserialize<'de>"))]
struct BootstrapFile<V> {
    #[serde(default, rename = "task")]
    tasks: Vec<TaskEntry<V>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, bound(deserialize = "V: Deserialize<'de>"))]
struct TaskEntry<V> {
    name: String,
    #[serde(default)]
    priority: i32,
    #[serde(default, rename = "record")]
    records: Vec<RecordEntry<V>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, bound(deserialize = "V: Deserialize<'de>"))]
struct RecordEntry<V> {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    values: BTreeMap<String, V>,
}

/// A scalar from a bootstrap file that can become a field value.
trait FileValue {
    fn into_value(self) -> Result<Value, String>;
}

impl FileValue for toml::Value {
    fn into_value(self) -> Result<Value, String> {
        match self {
            toml::Value::String(s) => Ok(Value::String(s)),
            toml::Value::Integer(i) => Ok(Value::Integer(i)),
            // shortest decimal text of the float, not its binary expansion
            toml::Value::Float(f) => Decimal::from_str(&f.to_string())
                .map(Value::Decimal)
                .map_err(|e| format!("{} is not a valid decimal: {}", f, e)),
            toml::Value::Boolean(b) => Ok(Value::Boolean(b)),
            // the registry parses timestamps from their RFC 3339 text
            toml::Value::Datetime(dt) => Ok(Value::String(dt.to_string())),
            other => Err(format!("unsupported value {}", other)),
        }
    }
}

impl FileValue for serde_json::Value {
    fn into_value(self) -> Result<Value, String> {
        match self {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Boolean(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Integer(i)),
                None => Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                    .map(Value::Decimal)
                    .map_err(|e| format!("{} is not a valid decimal: {}", n, e)),
            },
            serde_json::Value::String(s) => Ok(Value::String(s)),
            other => Err(format!("unsupported value {}", other)),
        }
    }
}

/// Reads bootstrap files into tasks. Records are checked against the
/// registry later, by the bootstrapper.
pub struct BootstrapConfigReader;

impl BootstrapConfigReader {
    /// Reads a `.json` file as JSON and anything else as TOML.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<BootstrapTask>, BootstrapError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                BootstrapError::Config(format!("bootstrap file {} does not exist", path.display()))
            }
            _ => BootstrapError::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(BootstrapError::Config(format!(
                "bootstrap file {} is not a file",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let tasks = if is_json {
            Self::parse_json(&contents)?
        } else {
            Self::parse_toml(&contents)?
        };
        tracing::debug!(path = %path.display(), tasks = tasks.len(), "bootstrap file read");
        Ok(tasks)
    }

    pub fn parse_toml(contents: &str) -> Result<Vec<BootstrapTask>, BootstrapError> {
        let file: BootstrapFile<toml::Value> =
            toml::from_str(contents).map_err(|e| BootstrapError::Config(e.to_string()))?;
        convert(file)
    }

    pub fn parse_json(contents: &str) -> Result<Vec<BootstrapTask>, BootstrapError> {
        let file: BootstrapFile<serde_json::Value> =
            serde_json::from_str(contents).map_err(|e| BootstrapError::Config(e.to_string()))?;
        convert(file)
    }
}

fn convert<V: FileValue>(file: BootstrapFile<V>) -> Result<Vec<BootstrapTask>, BootstrapError> {
    file.tasks
        .into_iter()
        .map(|task| -> Result<BootstrapTask, BootstrapError> {
            let records = task
                .records
                .into_iter()
                .map(|record| -> Result<BootstrapRecord, BootstrapError> {
                    let values = record
                        .values
                        .into_iter()
                        .map(|(field, value)| {
                            value.into_value().map(|v| (field.clone(), v)).map_err(|reason| {
                                BootstrapError::Validation {
                                    task: task.name.clone(),
                                    record_type: record.record_type.clone(),
                                    reason: format!("field {}: {}", field, reason),
                                }
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(BootstrapRecord {
                        record_type: record.record_type,
                        values,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BootstrapTask {
                name: task.name,
                priority: task.priority,
                records,
            })
        })
        .collect()
}
