use fundstore_core::{DeploymentReport, SchemaDiscrepancy, ValidationReport};
use prettytable::{row, Table};

use crate::bootstrap::BootstrapSummary;

fn discrepancy_row(table: &mut Table, discrepancy: &SchemaDiscrepancy) {
    let (kind, object) = match discrepancy {
        SchemaDiscrepancy::MissingSchema { schema } => ("missing schema", schema.clone()),
        SchemaDiscrepancy::MissingTable { table } => ("missing table", table.clone()),
        SchemaDiscrepancy::MissingColumn { table, column } => {
            ("missing column", format!("{}.{}", table, column))
        }
        SchemaDiscrepancy::TypeMismatch { table, column, .. } => {
            ("type mismatch", format!("{}.{}", table, column))
        }
        SchemaDiscrepancy::NullabilityMismatch { table, column, .. } => {
            ("nullability mismatch", format!("{}.{}", table, column))
        }
        SchemaDiscrepancy::ExtraTable { table } => ("extra table", table.clone()),
        SchemaDiscrepancy::ExtraColumn { table, column } => {
            ("extra column", format!("{}.{}", table, column))
        }
    };
    table.add_row(row![kind, object, discrepancy]);
}

pub fn validation_table(report: &ValidationReport) -> String {
    let mut table = Table::new();
    table.add_row(row!["Discrepancy", "Object", "Detail"]);
    table.add_empty_row();
    for discrepancy in report.discrepancies() {
        discrepancy_row(&mut table, discrepancy);
    }
    format!("\n{}\n", table)
}

pub fn deployment_table(report: &DeploymentReport) -> String {
    let mut table = Table::new();
    table.add_row(row!["Change"]);
    table.add_empty_row();
    for change in &report.changes {
        table.add_row(row![change]);
    }
    if !report.flagged.is_empty() {
        table.add_empty_row();
        table.add_row(row!["Left unchanged"]);
        for discrepancy in &report.flagged {
            table.add_row(row![discrepancy]);
        }
    }
    format!("\n{}\n", table)
}

pub fn bootstrap_table(summary: &BootstrapSummary) -> String {
    let mut table = Table::new();
    table.add_row(row!["Tasks", "Inserted", "Skipped"]);
    table.add_empty_row();
    table.add_row(row![summary.tasks, summary.inserted, summary.skipped]);
    format!("\n{}\n", table)
}
