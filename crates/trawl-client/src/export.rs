use std::path::{Path, PathBuf};

use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::models::Record;
use trawl_core::traits::Exporter;

const METADATA_COLUMNS: [&str; 3] = ["url", "scraped_at", "content_hash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    /// Split a destination into format and path.
    ///
    /// An explicit `json:` or `csv:` prefix wins; otherwise the extension
    /// decides.
    pub fn for_destination(destination: &str) -> Result<(Self, PathBuf), AppError> {
        if let Some(path) = destination.strip_prefix("json:") {
            return Ok((ExportFormat::Json, PathBuf::from(path)));
        }
        if let Some(path) = destination.strip_prefix("csv:") {
            return Ok((ExportFormat::Csv, PathBuf::from(path)));
        }

        let path = PathBuf::from(destination);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok((ExportFormat::Json, path)),
            Some("csv") => Ok((ExportFormat::Csv, path)),
            _ => Err(AppError::ExportError(format!(
                "Cannot infer export format for '{destination}' (use a .json/.csv extension or a json:/csv: prefix)"
            ))),
        }
    }

    pub fn render(&self, records: &[Record]) -> Result<Vec<u8>, AppError> {
        match self {
            ExportFormat::Json => render_json(records),
            ExportFormat::Csv => render_csv(records),
        }
    }
}

/// Writes records to a local file, overwriting it on each export.
#[derive(Debug, Clone, Default)]
pub struct FileExporter;

impl FileExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Exporter for FileExporter {
    async fn export(&self, records: &[Record], destination: &str) -> Result<(), AppError> {
        let (format, path) = ExportFormat::for_destination(destination)?;
        let bytes = format.render(records)?;
        write_file(&path, &bytes).await?;
        tracing::debug!(path = %path.display(), records = records.len(), ?format, "Export written");
        Ok(())
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            AppError::ExportError(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| AppError::ExportError(format!("Failed to write {}: {e}", path.display())))
}

fn render_json(records: &[Record]) -> Result<Vec<u8>, AppError> {
    let rows: Vec<Value> = records
        .iter()
        .map(|r| Value::Object(r.to_flat_json()))
        .collect();
    let mut bytes = serde_json::to_vec_pretty(&rows)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn render_csv(records: &[Record]) -> Result<Vec<u8>, AppError> {
    let mut header: Vec<String> = METADATA_COLUMNS.iter().map(|c| c.to_string()).collect();
    for record in records {
        for key in record.fields.keys() {
            if !header.contains(key) {
                header.push(key.clone());
            }
        }
    }

    let csv_err = |e: csv::Error| AppError::ExportError(format!("CSV write failed: {e}"));
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    writer.write_record(&header).map_err(csv_err)?;
    for record in records {
        let flat = record.to_flat_json();
        let row: Vec<String> = header
            .iter()
            .map(|col| flat.get(col).map(cell).unwrap_or_default())
            .collect();
        writer.write_record(&row).map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::ExportError(format!("CSV flush failed: {e}")))
}

/// Scalars as plain text; lists and objects as compact JSON.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
