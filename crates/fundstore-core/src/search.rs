//! Search terms for record queries.
//!
//! Callers describe a query with [`SearchTerm`]s in canonical field names.
//! The transaction resolves them against the registry into a physical
//! [`Filter`], which backends either render as SQL or evaluate row by row.

use std::{
    cmp::Ordering,
    fmt::{self, Display},
};

use crate::{
    schema::{quote_ident, ColumnDef},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOperator {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl SearchOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            SearchOperator::Equals => "=",
            SearchOperator::NotEquals => "<>",
            SearchOperator::LessThan => "<",
            SearchOperator::LessThanOrEqual => "<=",
            SearchOperator::GreaterThan => ">",
            SearchOperator::GreaterThanOrEqual => ">=",
        }
    }

    /// Applies the operator with SQL semantics: a NULL operand matches only
    /// through `Equals` (is null) and `NotEquals` (is not null), and a
    /// stored NULL never matches a non-null operand.
    pub fn matches(&self, stored: &Value, operand: &Value) -> bool {
        if operand.is_null() {
            return match self {
                SearchOperator::Equals => stored.is_null(),
                SearchOperator::NotEquals => !stored.is_null(),
                _ => false,
            };
        }
        let Some(ordering) = stored.compare(operand) else {
            return false;
        };
        match self {
            SearchOperator::Equals => ordering == Ordering::Equal,
            SearchOperator::NotEquals => ordering != Ordering::Equal,
            SearchOperator::LessThan => ordering == Ordering::Less,
            SearchOperator::LessThanOrEqual => ordering != Ordering::Greater,
            SearchOperator::GreaterThan => ordering == Ordering::Greater,
            SearchOperator::GreaterThanOrEqual => ordering != Ordering::Less,
        }
    }
}

impl Display for SearchOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// One condition of a record search. A list of terms matches when every
/// term matches.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchTerm {
    Field {
        field: String,
        operator: SearchOperator,
        value: Value,
    },
    /// Matches when any of the nested terms matches.
    Or(Vec<SearchTerm>),
}

impl SearchTerm {
    pub fn field(field: &str, operator: SearchOperator, value: impl Into<Value>) -> Self {
        SearchTerm::Field {
            field: field.to_string(),
            operator,
            value: value.into(),
        }
    }

    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Self::field(field, SearchOperator::Equals, value)
    }

    pub fn or(terms: impl IntoIterator<Item = SearchTerm>) -> Self {
        SearchTerm::Or(terms.into_iter().collect())
    }
}

/// A search condition over physical columns, with values already coerced
/// to the column types.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: ColumnDef,
        operator: SearchOperator,
        value: Value,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn equals(column: ColumnDef, value: Value) -> Self {
        Filter::Compare {
            column,
            operator: SearchOperator::Equals,
            value,
        }
    }

    /// Every column the filter reads.
    pub fn columns(&self) -> Vec<&ColumnDef> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns<'a>(&'a self, columns: &mut Vec<&'a ColumnDef>) {
        match self {
            Filter::Compare { column, .. } => columns.push(column),
            Filter::And(filters) | Filter::Or(filters) => {
                for filter in filters {
                    filter.collect_columns(columns);
                }
            }
        }
    }

    /// Evaluates the filter against one row. `value_of` returns the stored
    /// value of a column; an unknown column never matches.
    pub fn matches<'r, F>(&self, value_of: &F) -> bool
    where
        F: Fn(&ColumnDef) -> Option<&'r Value>,
    {
        match self {
            Filter::Compare {
                column,
                operator,
                value,
            } => value_of(column).map_or(false, |stored| operator.matches(stored, value)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(value_of)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(value_of)),
        }
    }

    /// Renders the filter as a SQL condition. NULL operands and the boolean
    /// structure are handled here; `compare` renders each remaining
    /// comparison and binds its value.
    pub fn to_sql(&self, compare: &mut dyn FnMut(&ColumnDef, SearchOperator, &Value) -> String) -> String {
        match self {
            Filter::Compare {
                column,
                operator,
                value: Value::Null,
            } => match operator {
                SearchOperator::Equals => format!("{} IS NULL", quote_ident(&column.name)),
                SearchOperator::NotEquals => format!("{} IS NOT NULL", quote_ident(&column.name)),
                _ => "1 = 0".to_string(),
            },
            Filter::Compare {
                column,
                operator,
                value,
            } => compare(column, *operator, value),
            Filter::And(filters) => join_sql(filters, " AND ", "1 = 1", compare),
            Filter::Or(filters) => join_sql(filters, " OR ", "1 = 0", compare),
        }
    }
}

fn join_sql(
    filters: &[Filter],
    separator: &str,
    empty: &str,
    compare: &mut dyn FnMut(&ColumnDef, SearchOperator, &Value) -> String,
) -> String {
    if filters.is_empty() {
        return empty.to_string();
    }
    let mut parts = Vec::with_capacity(filters.len());
    for filter in filters {
        parts.push(filter.to_sql(&mut *compare));
    }
    format!("({})", parts.join(separator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn column(name: &str, column_type: ColumnType) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            column_type,
            nullable: true,
            default: None,
            auto_increment: false,
        }
    }

    #[test]
    fn test_operator_null_semantics() {
        assert!(SearchOperator::Equals.matches(&Value::Null, &Value::Null));
        assert!(!SearchOperator::NotEquals.matches(&Value::Null, &Value::Null));
        assert!(SearchOperator::NotEquals.matches(&Value::Integer(1), &Value::Null));
        assert!(!SearchOperator::NotEquals.matches(&Value::Null, &Value::Integer(1)));
        assert!(!SearchOperator::LessThan.matches(&Value::Null, &Value::Integer(1)));
        assert!(SearchOperator::GreaterThanOrEqual.matches(&Value::Integer(5), &Value::Integer(5)));
        assert!(SearchOperator::LessThan.matches(&Value::from("apple"), &Value::from("pear")));
    }

    #[test]
    fn test_filter_matches_row() {
        let id = column("id", ColumnType::Integer);
        let title = column("title", ColumnType::Text);
        let filter = Filter::And(vec![
            Filter::Compare {
                column: id.clone(),
                operator: SearchOperator::GreaterThan,
                value: Value::Integer(10),
            },
            Filter::Or(vec![
                Filter::equals(title.clone(), Value::from("Operating")),
                Filter::equals(title.clone(), Value::from("Reserve")),
            ]),
        ]);
        let row = |id_value: i64, title_value: &str| vec![Value::Integer(id_value), Value::from(title_value)];
        let check = |values: Vec<Value>| {
            let lookup = |c: &ColumnDef| match c.name.as_str() {
                "id" => values.first(),
                "title" => values.get(1),
                _ => None,
            };
            filter.matches(&lookup)
        };
        assert!(check(row(11, "Reserve")));
        assert!(!check(row(10, "Reserve")));
        assert!(!check(row(12, "Payroll")));
        assert_eq!(filter.columns().len(), 3);
    }

    #[test]
    fn test_filter_sql() {
        let id = column("id", ColumnType::Integer);
        let memo = column("memo", ColumnType::Text);
        let filter = Filter::And(vec![
            Filter::Compare {
                column: id,
                operator: SearchOperator::LessThanOrEqual,
                value: Value::Integer(3),
            },
            Filter::Or(vec![
                Filter::equals(memo.clone(), Value::Null),
                Filter::Compare {
                    column: memo,
                    operator: SearchOperator::NotEquals,
                    value: Value::from("void"),
                },
            ]),
            Filter::Or(vec![]),
        ]);
        let mut bound = Vec::new();
        let sql = filter.to_sql(&mut |column, operator, value| {
            bound.push(value.clone());
            format!("{} {} ?{}", quote_ident(&column.name), operator, bound.len())
        });
        assert_eq!(
            sql,
            "(\"id\" <= ?1 AND (\"memo\" IS NULL OR \"memo\" <> ?2) AND 1 = 0)"
        );
        assert_eq!(bound, vec![Value::Integer(3), Value::from("void")]);
    }
}
