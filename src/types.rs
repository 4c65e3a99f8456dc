//! The application's record types.

use std::sync::Arc;

use fundstore_core::{Field, FieldType, RecordType, RecordTypeRegistry, StorageError};

pub fn record_types() -> Result<Vec<RecordType>, StorageError> {
    Ok(vec![
        RecordType::builder("AccountCode")
            .field(Field::required("id", FieldType::Integer))
            .field(Field::required("title", FieldType::String))
            .key("id")
            .build()?,
        RecordType::builder("Account")
            .field(Field::required("id", FieldType::Integer))
            .field(Field::required("title", FieldType::String))
            .field(Field::required("default_account_code", FieldType::Reference("AccountCode".into())))
            .field(Field::required("account_type", FieldType::String).with_default("general"))
            .key("id")
            .build()?,
        // keyed by its account, so its own references resolve through Account
        RecordType::builder("BankAccount")
            .field(Field::required("account", FieldType::Reference("Account".into())))
            .field(Field::required("bank_account_type", FieldType::String))
            .field(Field::optional("interest_rate", FieldType::Decimal))
            .key("account")
            .build()?,
        RecordType::builder("AccountTransaction")
            .field(Field::auto_numbered("id"))
            .field(Field::required("account", FieldType::Reference("Account".into())))
            .field(Field::required("date", FieldType::Timestamp))
            .field(Field::required("amount", FieldType::Decimal))
            .field(Field::optional("memo", FieldType::String))
            .key("id")
            .build()?,
        RecordType::builder("SystemProperty")
            .field(Field::required("id", FieldType::Integer))
            .field(Field::required("name", FieldType::String))
            .field(Field::optional("integer_value", FieldType::Integer))
            .field(Field::optional("boolean_value", FieldType::Boolean))
            .key("id")
            .build()?,
        RecordType::builder("User")
            .field(Field::required("id", FieldType::Integer))
            .field(Field::required("identifier", FieldType::String))
            .field(Field::optional("email", FieldType::String))
            .field(Field::optional("name", FieldType::String))
            .key("id")
            .build()?,
        RecordType::builder("RoleGrant")
            .field(Field::required("id", FieldType::Integer))
            .field(Field::required("user_id", FieldType::Reference("User".into())))
            .field(Field::required("name", FieldType::String))
            .key("id")
            .build()?,
    ])
}

/// The sealed registry every component of the application shares.
pub fn registry() -> Result<Arc<RecordTypeRegistry>, StorageError> {
    RecordTypeRegistry::from_types(record_types()?)
}
