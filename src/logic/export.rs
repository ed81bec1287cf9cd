//! Export pipeline
//!
//! Materializes filtered datasets to files for offline training. Export is
//! best-effort and diagnostic-first: a validation pass reports null
//! critical fields and the duplicate-hash ratio without ever blocking file
//! creation, and an IO failure on one dataset never aborts its siblings.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

struct DatasetSpec {
    name: &'static str,
    time_column: &'static str,
    /// Columns that must never be null in a usable training row
    critical_columns: &'static [&'static str],
    hash_column: Option<&'static str>,
}

/// The six logical datasets the core produces
const DATASETS: &[DatasetSpec] = &[
    DatasetSpec {
        name: "ml_training_records",
        time_column: "detected_at",
        critical_columns: &["account_hash", "resource_hash", "confidence_level"],
        hash_column: Some("resource_hash"),
    },
    DatasetSpec {
        name: "resource_lifecycle_events",
        time_column: "occurred_at",
        critical_columns: &["resource_hash", "event_type"],
        hash_column: Some("resource_hash"),
    },
    DatasetSpec {
        name: "user_action_patterns",
        time_column: "action_at",
        critical_columns: &["user_hash", "resource_hash", "action_taken"],
        hash_column: Some("resource_hash"),
    },
    DatasetSpec {
        name: "cost_trends",
        time_column: "computed_at",
        critical_columns: &["account_hash", "month", "provider"],
        hash_column: Some("account_hash"),
    },
    DatasetSpec {
        name: "detection_events",
        time_column: "detected_at",
        critical_columns: &["resource_id", "confidence"],
        hash_column: None,
    },
    DatasetSpec {
        name: "detection_rules",
        time_column: "updated_at",
        critical_columns: &["resource_type", "owner_scope"],
        hash_column: None,
    },
];

pub fn dataset_names() -> Vec<&'static str> {
    DATASETS.iter().map(|d| d.name).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub rows: usize,
    pub null_critical_fields: usize,
    pub duplicate_hash_ratio: f64,
}

#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub path: PathBuf,
    pub record_count: usize,
    pub validation: ValidationReport,
}

/// Outcome of exporting every dataset. Failed datasets land in `errors`
/// next to their successful siblings.
#[derive(Debug, Default, Serialize)]
pub struct ExportBatch {
    pub paths: BTreeMap<String, String>,
    pub record_counts: BTreeMap<String, usize>,
    pub validations: BTreeMap<String, ValidationReport>,
    pub errors: BTreeMap<String, String>,
}

fn spec_for(dataset: &str) -> CoreResult<&'static DatasetSpec> {
    DATASETS
        .iter()
        .find(|spec| spec.name == dataset)
        .ok_or_else(|| CoreError::UnknownDataset(dataset.to_string()))
}

/// Read the filtered rows as JSON objects, keeping column order
fn read_rows(
    conn: &Connection,
    spec: &DatasetSpec,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CoreResult<(Vec<String>, Vec<Vec<Value>>)> {
    let sql = format!(
        "SELECT * FROM {table} WHERE {col} >= ?1 AND {col} < ?2 ORDER BY {col}",
        table = spec.name,
        col = spec.time_column,
    );
    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows_out = Vec::new();
    let mut rows = stmt.query(rusqlite::params![
        crate::db::ts(start),
        crate::db::ts(end)
    ])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(match row.get_ref(idx)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::from(i),
                ValueRef::Real(f) => serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                ValueRef::Text(bytes) => {
                    let text = String::from_utf8_lossy(bytes).to_string();
                    // JSON columns come back nested rather than as strings.
                    if text.starts_with('{') || text.starts_with('[') {
                        serde_json::from_str(&text).unwrap_or(Value::String(text))
                    } else {
                        Value::String(text)
                    }
                }
                ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
            });
        }
        rows_out.push(values);
    }
    Ok((columns, rows_out))
}

fn validate(spec: &DatasetSpec, columns: &[String], rows: &[Vec<Value>]) -> ValidationReport {
    let critical_idx: Vec<usize> = spec
        .critical_columns
        .iter()
        .filter_map(|name| columns.iter().position(|c| c == name))
        .collect();

    let null_critical_fields = rows
        .iter()
        .filter(|row| {
            critical_idx.iter().any(|&idx| match &row[idx] {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            })
        })
        .count();

    let duplicate_hash_ratio = match spec
        .hash_column
        .and_then(|name| columns.iter().position(|c| c == name))
    {
        Some(idx) if !rows.is_empty() => {
            let distinct: std::collections::HashSet<&Value> =
                rows.iter().map(|row| &row[idx]).collect();
            1.0 - distinct.len() as f64 / rows.len() as f64
        }
        _ => 0.0,
    };

    ValidationReport {
        rows: rows.len(),
        null_critical_fields,
        duplicate_hash_ratio,
    }
}

fn csv_field(value: &Value) -> String {
    let raw = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

fn write_file(
    path: &Path,
    format: ExportFormat,
    columns: &[String],
    rows: &[Vec<Value>],
) -> CoreResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match format {
        ExportFormat::Json => {
            let objects: Vec<Value> = rows
                .iter()
                .map(|row| {
                    Value::Object(
                        columns
                            .iter()
                            .cloned()
                            .zip(row.iter().cloned())
                            .collect(),
                    )
                })
                .collect();
            serde_json::to_writer_pretty(&mut writer, &objects)?;
            writer.write_all(b"\n")?;
        }
        ExportFormat::Csv => {
            writeln!(writer, "{}", columns.join(","))?;
            for row in rows {
                let line: Vec<String> = row.iter().map(csv_field).collect();
                writeln!(writer, "{}", line.join(","))?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Export one dataset for [start, end). Validation problems are reported
/// in the result, never as an error.
pub fn export_dataset(
    conn: &Connection,
    out_dir: &Path,
    dataset: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    format: ExportFormat,
) -> CoreResult<ExportResult> {
    let spec = spec_for(dataset)?;
    let (columns, rows) = read_rows(conn, spec, start, end)?;
    let validation = validate(spec, &columns, &rows);

    fs::create_dir_all(out_dir)?;
    let filename = format!(
        "{}_{}.{}",
        spec.name,
        Utc::now().format("%Y%m%d"),
        format.extension()
    );
    let path = out_dir.join(filename);
    write_file(&path, format, &columns, &rows)?;

    if validation.null_critical_fields > 0 {
        tracing::warn!(
            dataset,
            rows = validation.rows,
            null_critical = validation.null_critical_fields,
            "Export validation found incomplete rows"
        );
    }

    Ok(ExportResult {
        path,
        record_count: rows.len(),
        validation,
    })
}

/// Export every dataset; one dataset's IO failure does not abort the rest
pub fn export_all(
    conn: &Connection,
    out_dir: &Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    format: ExportFormat,
) -> ExportBatch {
    let mut batch = ExportBatch::default();
    for spec in DATASETS {
        match export_dataset(conn, out_dir, spec.name, start, end, format) {
            Ok(result) => {
                batch
                    .paths
                    .insert(spec.name.to_string(), result.path.display().to_string());
                batch
                    .record_counts
                    .insert(spec.name.to_string(), result.record_count);
                batch
                    .validations
                    .insert(spec.name.to_string(), result.validation);
            }
            Err(err) => {
                tracing::error!(dataset = spec.name, error = %err, "Dataset export failed");
                batch.errors.insert(spec.name.to_string(), err.to_string());
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::logic::anonymize::Anonymizer;
    use crate::logic::collector;
    use crate::models::{Confidence, DetectionEvent, Provider};
    use chrono::TimeZone;
    use std::collections::BTreeMap as Map;
    use uuid::Uuid;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
        )
    }

    fn seeded_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        let anon = Anonymizer::new("export-test-salt").unwrap();
        let event = |id: &str| DetectionEvent {
            scan_id: Uuid::nil(),
            resource_id: id.to_string(),
            resource_type: "ebs_volume".to_string(),
            provider: Provider::Aws,
            region: "us-east-1".to_string(),
            state: "available".to_string(),
            age_days: 95,
            size_gb: Some(100.0),
            estimated_monthly_cost: 45.20,
            metrics: vec![],
            tags: Map::new(),
            confidence: Confidence::Critical,
            detection_scenario: "idle volume".to_string(),
            detected_at: Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap(),
        };
        db.with(|conn| {
            collector::collect(
                conn,
                &anon,
                Uuid::nil(),
                &[event("vol-1"), event("vol-2")],
                "acct-1",
            )
        })
        .unwrap();
        db
    }

    #[test]
    fn json_export_writes_dated_file_with_rows() {
        let db = seeded_db();
        let dir = tempfile::tempdir().unwrap();
        let (start, end) = range();

        let result = db
            .with(|conn| {
                export_dataset(conn, dir.path(), "ml_training_records", start, end, ExportFormat::Json)
            })
            .unwrap();

        assert_eq!(result.record_count, 2);
        let name = result.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ml_training_records_"));
        assert!(name.ends_with(".json"));

        let content = fs::read_to_string(&result.path).unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].get("resource_hash").is_some());
        // Nested JSON columns are real objects, not strings.
        assert!(parsed[0].get("resource_config").unwrap().is_object());
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let db = seeded_db();
        let dir = tempfile::tempdir().unwrap();
        let (start, end) = range();

        let result = db
            .with(|conn| {
                export_dataset(conn, dir.path(), "ml_training_records", start, end, ExportFormat::Csv)
            })
            .unwrap();

        let content = fs::read_to_string(&result.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,schema_version,account_hash"));
    }

    #[test]
    fn csv_fields_with_commas_are_quoted() {
        assert_eq!(csv_field(&Value::String("a,b".to_string())), "\"a,b\"");
        assert_eq!(csv_field(&Value::String("say \"hi\"".to_string())), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field(&Value::Null), "");
    }

    #[test]
    fn date_filter_excludes_out_of_range_rows() {
        let db = seeded_db();
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();

        let result = db
            .with(|conn| {
                export_dataset(conn, dir.path(), "ml_training_records", start, end, ExportFormat::Json)
            })
            .unwrap();
        assert_eq!(result.record_count, 0);
    }

    #[test]
    fn validation_reports_duplicate_hash_ratio() {
        let db = seeded_db();
        // Re-collect the same resources so every hash appears twice.
        let anon = Anonymizer::new("export-test-salt").unwrap();
        db.with(|conn| {
            let event = DetectionEvent {
                scan_id: Uuid::new_v4(),
                resource_id: "vol-1".to_string(),
                resource_type: "ebs_volume".to_string(),
                provider: Provider::Aws,
                region: "us-east-1".to_string(),
                state: "available".to_string(),
                age_days: 100,
                size_gb: Some(100.0),
                estimated_monthly_cost: 45.20,
                metrics: vec![],
                tags: Map::new(),
                confidence: Confidence::Critical,
                detection_scenario: "idle volume".to_string(),
                detected_at: Utc.with_ymd_and_hms(2025, 6, 12, 0, 0, 0).unwrap(),
            };
            collector::collect(conn, &anon, Uuid::new_v4(), &[event], "acct-1")
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (start, end) = range();
        let result = db
            .with(|conn| {
                export_dataset(conn, dir.path(), "ml_training_records", start, end, ExportFormat::Json)
            })
            .unwrap();

        // 3 rows, 2 distinct hashes.
        assert_eq!(result.validation.rows, 3);
        assert!((result.validation.duplicate_hash_ratio - (1.0 - 2.0 / 3.0)).abs() < 1e-9);
        assert_eq!(result.validation.null_critical_fields, 0);
    }

    #[test]
    fn unknown_dataset_is_rejected() {
        let db = seeded_db();
        let dir = tempfile::tempdir().unwrap();
        let (start, end) = range();
        let err = db
            .with(|conn| export_dataset(conn, dir.path(), "secrets", start, end, ExportFormat::Json))
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownDataset(_)));
    }

    #[test]
    fn sibling_datasets_survive_one_failure() {
        let db = seeded_db();
        let dir = tempfile::tempdir().unwrap();
        let (start, end) = range();

        // Block the training-records output path with a directory so that
        // dataset's File::create fails while every sibling stays writable.
        let blocked = dir.path().join(format!(
            "ml_training_records_{}.json",
            Utc::now().format("%Y%m%d")
        ));
        fs::create_dir_all(&blocked).unwrap();

        let batch = db
            .with(|conn| Ok(export_all(conn, dir.path(), start, end, ExportFormat::Json)))
            .unwrap();

        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors.contains_key("ml_training_records"));
        assert!(!batch.paths.contains_key("ml_training_records"));
        assert_eq!(batch.paths.len(), dataset_names().len() - 1);
        assert_eq!(batch.record_counts["resource_lifecycle_events"], 2);
    }
}
