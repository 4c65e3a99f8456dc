use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
};

use convert_case::{Case, Casing};
use rust_decimal::Decimal;

use crate::{
    storage::StorageError,
    value::{parse_timestamp, Value},
};

/// Converts a declared name into the dialect-independent canonical form.
///
/// Canonical names are `lower_snake_case` and never change when converted
/// again, which is what lets every variant handler round-trip them.
pub fn canonical_name(declared: &str) -> Result<String, StorageError> {
    let name = declared.trim().to_case(Case::Snake);
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StorageError::InvalidIdentifier(declared.to_string()));
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    String,
    Decimal,
    Timestamp,
    Boolean,
    /// Holds the key value of a record of the named type.
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    field_type: FieldType,
    nullable: bool,
    default: Option<Value>,
    auto_numbered: bool,
}

impl Field {
    pub fn required(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: false,
            default: None,
            auto_numbered: false,
        }
    }

    /// Integer key whose value the store assigns when a record is inserted.
    /// Must be declared as the key of its type.
    pub fn auto_numbered(name: &str) -> Self {
        Self {
            auto_numbered: true,
            ..Self::required(name, FieldType::Integer)
        }
    }

    pub fn optional(name: &str, field_type: FieldType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_auto_numbered(&self) -> bool {
        self.auto_numbered
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordType {
    name: String,
    fields: Vec<Field>,
    key: Option<String>,
}

impl RecordType {
    pub fn builder(name: &str) -> RecordTypeBuilder {
        RecordTypeBuilder {
            name: name.to_string(),
            fields: Vec::new(),
            key: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        let name = canonical_name(name).ok()?;
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key(&self) -> Option<&Field> {
        let key = self.key.as_deref()?;
        self.fields.iter().find(|f| f.name == key)
    }
}

pub struct RecordTypeBuilder {
    name: String,
    fields: Vec<Field>,
    key: Option<String>,
}

impl RecordTypeBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Marks the identity field. It becomes the primary key of the table.
    pub fn key(mut self, field: &str) -> Self {
        self.key = Some(field.to_string());
        self
    }

    pub fn build(self) -> Result<RecordType, StorageError> {
        let name = canonical_name(&self.name)?;
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(self.fields.len());
        for mut field in self.fields {
            field.name = canonical_name(&field.name)?;
            if let FieldType::Reference(target) = &field.field_type {
                field.field_type = FieldType::Reference(canonical_name(target)?);
            }
            if !seen.insert(field.name.clone()) {
                return Err(StorageError::DuplicateField {
                    record_type: name,
                    field: field.name,
                });
            }
            fields.push(field);
        }

        let key = match self.key {
            Some(key) => {
                let key = canonical_name(&key)?;
                match fields.iter().find(|f| f.name == key) {
                    None => {
                        return Err(StorageError::InvalidKey {
                            record_type: name,
                            reason: format!("no field named {}", key),
                        })
                    }
                    Some(f) if f.nullable => {
                        return Err(StorageError::InvalidKey {
                            record_type: name,
                            reason: format!("key field {} must not be nullable", key),
                        })
                    }
                    Some(_) => Some(key),
                }
            }
            None => None,
        };
        if let Some(field) = fields
            .iter()
            .find(|f| f.auto_numbered && key.as_deref() != Some(f.name.as_str()))
        {
            return Err(StorageError::InvalidKey {
                record_type: name,
                reason: format!("auto-numbered field {} must be the key", field.name),
            });
        }

        Ok(RecordType { name, fields, key })
    }
}

/// Catalog of every record type the application knows.
///
/// Types are registered during startup, then the registry is sealed and
/// shared read-only (usually behind an `Arc`).
#[derive(Debug, Default)]
pub struct RecordTypeRegistry {
    types: Vec<RecordType>,
    by_name: HashMap<String, usize>,
    sealed: bool,
}

impl RecordTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers and seals in one step.
    pub fn from_types(
        types: impl IntoIterator<Item = RecordType>,
    ) -> Result<Arc<Self>, StorageError> {
        let mut registry = Self::new();
        for record_type in types {
            registry.register(record_type)?;
        }
        registry.seal()?;
        Ok(Arc::new(registry))
    }

    pub fn register(&mut self, record_type: RecordType) -> Result<(), StorageError> {
        if self.sealed {
            return Err(StorageError::RegistrySealed);
        }
        if self.by_name.contains_key(record_type.name()) {
            return Err(StorageError::DuplicateType(record_type.name.clone()));
        }
        self.by_name
            .insert(record_type.name.clone(), self.types.len());
        self.types.push(record_type);
        Ok(())
    }

    /// Checks cross-type invariants and closes the registry for registration.
    pub fn seal(&mut self) -> Result<(), StorageError> {
        if self.sealed {
            return Ok(());
        }
        for record_type in &self.types {
            for field in &record_type.fields {
                if let FieldType::Reference(target) = &field.field_type {
                    if !self.by_name.contains_key(target) {
                        return Err(StorageError::DanglingReference {
                            record_type: record_type.name.clone(),
                            field: field.name.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        self.sealed = true;
        tracing::debug!(types = self.types.len(), "record type registry sealed");
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn ensure_sealed(&self) -> Result<(), StorageError> {
        if self.sealed {
            Ok(())
        } else {
            Err(StorageError::RegistryNotSealed)
        }
    }

    pub fn get(&self, name: &str) -> Result<&RecordType, StorageError> {
        canonical_name(name)
            .ok()
            .and_then(|canonical| self.by_name.get(&canonical))
            .map(|i| &self.types[*i])
            .ok_or_else(|| StorageError::UnknownType(name.to_string()))
    }

    /// Every registered type, in registration order.
    pub fn all(&self) -> &[RecordType] {
        &self.types
    }

    /// Resolves the scalar type a reference to `target` is stored as.
    ///
    /// Follows key fields that are themselves references. A type without a
    /// key, or a cycle of keys, resolves to `Integer`.
    pub fn resolve_reference(&self, target: &str) -> FieldType {
        let mut visited = HashSet::new();
        let mut current = target.to_string();
        loop {
            if !visited.insert(current.clone()) {
                tracing::warn!(record_type = target, "cyclic key references, storing as integer");
                return FieldType::Integer;
            }
            let key_type = self
                .by_name
                .get(&current)
                .and_then(|i| self.types[*i].key())
                .map(|k| k.field_type.clone());
            match key_type {
                Some(FieldType::Reference(next)) => current = next,
                Some(scalar) => return scalar,
                None => return FieldType::Integer,
            }
        }
    }

    /// Validates a complete set of values for a new record.
    ///
    /// Returns the values in field order with canonical field names, coerced
    /// to the declared types, with defaults filled in for absent fields. An
    /// auto-numbered key is left out for the store to assign.
    pub fn validate_values(
        &self,
        record_type: &str,
        values: &[(&str, Value)],
    ) -> Result<Vec<(String, Value)>, StorageError> {
        let record_type = self.get(record_type)?;
        let mut provided = self.coerce_all(record_type, values)?;
        let mut result = Vec::with_capacity(record_type.fields.len());
        for field in &record_type.fields {
            if field.auto_numbered {
                continue;
            }
            let value = match provided.remove(&field.name) {
                Some(v) => v,
                None => field.default.clone().unwrap_or(Value::Null),
            };
            if value.is_null() && !field.nullable {
                return Err(StorageError::InvalidRecord {
                    record_type: record_type.name.clone(),
                    reason: format!("field {} is required", field.name),
                });
            }
            result.push((field.name.clone(), value));
        }
        Ok(result)
    }

    /// Validates a subset of values, as supplied to an update.
    pub fn validate_partial(
        &self,
        record_type: &str,
        values: &[(&str, Value)],
    ) -> Result<Vec<(String, Value)>, StorageError> {
        let record_type = self.get(record_type)?;
        let mut provided = self.coerce_all(record_type, values)?;
        let mut result = Vec::with_capacity(provided.len());
        for field in &record_type.fields {
            if let Some(value) = provided.remove(&field.name) {
                if value.is_null() && !field.nullable {
                    return Err(StorageError::InvalidRecord {
                        record_type: record_type.name.clone(),
                        reason: format!("field {} is required", field.name),
                    });
                }
                result.push((field.name.clone(), value));
            }
        }
        Ok(result)
    }

    fn coerce_all(
        &self,
        record_type: &RecordType,
        values: &[(&str, Value)],
    ) -> Result<HashMap<String, Value>, StorageError> {
        let mut provided = HashMap::with_capacity(values.len());
        for (name, value) in values {
            let field = record_type
                .field(name)
                .ok_or_else(|| StorageError::UnknownField {
                    record_type: record_type.name.clone(),
                    field: name.to_string(),
                })?;
            if field.auto_numbered {
                return Err(StorageError::InvalidRecord {
                    record_type: record_type.name.clone(),
                    reason: format!("field {} is assigned by the store", field.name),
                });
            }
            let coerced = self.coerce(field, value.clone()).map_err(|reason| {
                StorageError::InvalidRecord {
                    record_type: record_type.name.clone(),
                    reason,
                }
            })?;
            if provided.insert(field.name.clone(), coerced).is_some() {
                return Err(StorageError::InvalidRecord {
                    record_type: record_type.name.clone(),
                    reason: format!("field {} given more than once", field.name),
                });
            }
        }
        Ok(provided)
    }

    /// Resolves one field of a type and coerces a value to its declared type,
    /// as used for search operands and key lookups.
    pub fn validate_field_value(
        &self,
        record_type: &str,
        field: &str,
        value: Value,
    ) -> Result<(String, Value), StorageError> {
        let record_type = self.get(record_type)?;
        let field = record_type
            .field(field)
            .ok_or_else(|| StorageError::UnknownField {
                record_type: record_type.name.clone(),
                field: field.to_string(),
            })?;
        let value = self
            .coerce(field, value)
            .map_err(|reason| StorageError::InvalidRecord {
                record_type: record_type.name.clone(),
                reason,
            })?;
        Ok((field.name.clone(), value))
    }

    fn coerce(&self, field: &Field, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(value);
        }
        let scalar = match &field.field_type {
            FieldType::Reference(target) => self.resolve_reference(target),
            other => other.clone(),
        };
        let mismatch = |value: &Value| {
            format!(
                "field {} expects {:?} but a {} value was provided",
                field.name,
                scalar,
                value.type_name()
            )
        };
        match (&scalar, value) {
            (FieldType::Integer, v @ Value::Integer(_)) => Ok(v),
            (FieldType::String, v @ Value::String(_)) => Ok(v),
            (FieldType::Boolean, v @ Value::Boolean(_)) => Ok(v),
            (FieldType::Decimal, v @ Value::Decimal(_)) => Ok(v),
            (FieldType::Decimal, Value::Integer(i)) => Ok(Value::Decimal(Decimal::from(i))),
            (FieldType::Decimal, Value::String(s)) => Decimal::from_str(s.trim())
                .map(Value::Decimal)
                .map_err(|_| format!("field {} expects a decimal, got '{}'", field.name, s)),
            (FieldType::Timestamp, v @ Value::Timestamp(_)) => Ok(v),
            (FieldType::Timestamp, Value::String(s)) => parse_timestamp(s.trim())
                .map(Value::Timestamp)
                .ok_or_else(|| {
                    format!("field {} expects an RFC 3339 timestamp, got '{}'", field.name, s)
                }),
            (_, v) => Err(mismatch(&v)),
        }
    }
}
