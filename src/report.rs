use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use console::style;

use crate::domain::{ModelInfo, Params, ScalerInfo, REPORT_FILE_PREFIX};

const HEADER_PROPERTY: &str = "Property";
const HEADER_VALUE: &str = "Value";
/// Extra width given to header cells, matching the usual markdown table
/// writers.
const HEADER_PADDING: usize = 2;

const ENGINEERING_NOTES: [&str; 3] = [
    "Artifact-only inspection",
    "XGBoost / sklearn safe",
    "Raw internals intentionally hidden",
];

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to create reports directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write report {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn report_file_name(timestamp: &DateTime<Local>) -> String {
    format!("{REPORT_FILE_PREFIX}{}.md", timestamp.format("%Y_%m_%d_%H_%M_%S"))
}

pub fn generate_report(
    model_info: &ModelInfo,
    scaler_info: Option<&ScalerInfo>,
    output_dir: &Path,
) -> Result<PathBuf, ReportError> {
    generate_report_at(model_info, scaler_info, output_dir, &Local::now())
}

/// Writes the report stamped with `timestamp`. A report written within the
/// same second replaces the earlier one.
pub fn generate_report_at(
    model_info: &ModelInfo,
    scaler_info: Option<&ScalerInfo>,
    output_dir: &Path,
    timestamp: &DateTime<Local>,
) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(output_dir).map_err(|source| ReportError::CreateDir {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let report_path = output_dir.join(report_file_name(timestamp));
    let document = render_report(model_info, scaler_info, timestamp);
    fs::write(&report_path, document).map_err(|source| ReportError::Write {
        path: report_path.clone(),
        source,
    })?;

    Ok(report_path)
}

pub fn render_report(
    model_info: &ModelInfo,
    scaler_info: Option<&ScalerInfo>,
    generated_on: &DateTime<Local>,
) -> String {
    let importance = &model_info.feature_importance;
    let mut out = String::new();

    out.push_str("# Model Inspection Report\n\n");
    out.push_str(&format!(
        "Generated on: {}\n\n",
        generated_on.format("%Y-%m-%d %H:%M:%S%.6f")
    ));

    out.push_str("## Model Overview\n\n");
    out.push_str(&render_table(&[
        ("Class", model_info.class_name.clone()),
        ("Module", model_info.module.clone()),
        ("Task", model_info.task.to_string()),
        ("Has Coefficients", py_bool(model_info.has_coefficients)),
        ("Feature Importance Available", py_bool(importance.available())),
        (
            "Feature Importance Type",
            importance
                .kind()
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "None".to_string()),
        ),
    ]));
    out.push_str("\n\n");

    out.push_str("## Feature Importance Details\n\n");
    out.push_str(&render_params(importance.details()));
    out.push_str("\n\n");

    out.push_str("## Hyperparameters\n\n");
    out.push_str(&render_params(Some(&model_info.hyperparameters)));
    out.push_str("\n\n");

    if let Some(scaler) = scaler_info {
        out.push_str("## Preprocessing\n\n");
        out.push_str(&render_table(&[
            ("Scaler", scaler.class_name.clone()),
            ("Module", scaler.module.clone()),
        ]));
        out.push_str("\n\n");
    }

    out.push_str("## Engineering Notes\n");
    for note in ENGINEERING_NOTES {
        out.push_str(&format!("- {note}\n"));
    }

    out
}

/// Reduced summary for interactive output. Errors are the caller's to
/// downgrade.
pub fn print_console_summary(
    model_info: &ModelInfo,
    scaler_info: Option<&ScalerInfo>,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", style("MODEL SUMMARY").bold())?;
    writeln!(
        out,
        "{}",
        render_table(&[
            ("Class", model_info.class_name.clone()),
            ("Module", model_info.module.clone()),
            ("Task", model_info.task.to_string()),
        ])
    )?;
    if let Some(scaler) = scaler_info {
        writeln!(out, "scaler: {} ({})", scaler.class_name, scaler.module)?;
    }
    out.flush()
}

fn render_params(params: Option<&Params>) -> String {
    let rows: Vec<(&str, String)> = params
        .into_iter()
        .flatten()
        .map(|(key, value)| (key.as_str(), value.to_string()))
        .collect();
    render_table(&rows)
}

/// Two-column GitHub-style grid with a `Property | Value` header.
pub fn render_table(rows: &[(&str, String)]) -> String {
    let key_width = rows
        .iter()
        .map(|(key, _)| key.chars().count())
        .fold(HEADER_PROPERTY.len() + HEADER_PADDING, usize::max);
    let value_width = rows
        .iter()
        .map(|(_, value)| value.chars().count())
        .fold(HEADER_VALUE.len() + HEADER_PADDING, usize::max);

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!(
        "| {HEADER_PROPERTY:<key_width$} | {HEADER_VALUE:<value_width$} |"
    ));
    lines.push(format!(
        "|{}|{}|",
        "-".repeat(key_width + 2),
        "-".repeat(value_width + 2)
    ));
    for (key, value) in rows {
        lines.push(format!("| {key:<key_width$} | {value:<value_width$} |"));
    }
    lines.join("\n")
}

fn py_bool(value: bool) -> String {
    let text = if value { "True" } else { "False" };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::render_table;

    #[test]
    fn table_pads_columns_to_widest_cell() {
        let table = render_table(&[("Class", "RandomForestClassifier".to_string())]);
        let expected = "\
| Property   | Value                  |
|------------|------------------------|
| Class      | RandomForestClassifier |";
        assert_eq!(table, expected);
    }

    #[test]
    fn empty_table_keeps_header() {
        let table = render_table(&[]);
        assert_eq!(table, "| Property   | Value   |\n|------------|---------|");
    }
}
