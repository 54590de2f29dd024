use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::models::ExtractionSchema;

const EXTENSIONS: [&str; 2] = ["json", "toml"];

/// Resolves a job's `schema_ref` to a loaded [`ExtractionSchema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaResolver {
    schemas_dir: Option<PathBuf>,
}

impl SchemaResolver {
    pub fn new(schemas_dir: Option<PathBuf>) -> Self {
        Self { schemas_dir }
    }

    /// Resolve a schema reference.
    ///
    /// Accepts:
    /// - A direct file path (e.g. `schemas/quotes.json`)
    /// - A bare name looked up in `schemas_dir` as `{name}.json` or `{name}.toml`
    pub fn resolve(&self, schema_ref: &str) -> Result<ExtractionSchema, AppError> {
        let path = self.resolve_path(schema_ref)?;
        load_schema(&path)
    }

    fn resolve_path(&self, schema_ref: &str) -> Result<PathBuf, AppError> {
        let direct = PathBuf::from(schema_ref);
        if direct.is_file() {
            return Ok(direct);
        }

        let dir = self.schemas_dir.as_ref().ok_or_else(|| {
            AppError::SchemaError(format!(
                "Schema not found: {schema_ref} (no schemas_dir configured)"
            ))
        })?;
        if schema_ref.is_empty() || schema_ref.contains(['/', '\\']) {
            return Err(AppError::SchemaError(format!("Schema not found: {schema_ref}")));
        }

        EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{schema_ref}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                AppError::SchemaError(format!(
                    "Schema '{schema_ref}' not found in {}",
                    dir.display()
                ))
            })
    }
}

/// Load a schema file; the format follows the extension (`.toml`, else JSON).
pub fn load_schema(path: &Path) -> Result<ExtractionSchema, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::SchemaError(format!("Failed to read schema file {}: {e}", path.display()))
    })?;

    let mut schema: ExtractionSchema = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|e| {
            AppError::SchemaError(format!("Invalid TOML in schema file {}: {e}", path.display()))
        })?,
        _ => serde_json::from_str(&content).map_err(|e| {
            AppError::SchemaError(format!("Invalid JSON in schema file {}: {e}", path.display()))
        })?,
    };

    if schema.fields.is_empty() {
        return Err(AppError::SchemaError(format!(
            "Schema {} defines no fields",
            path.display()
        )));
    }
    if schema.name.is_empty() {
        schema.name = derive_schema_name(path);
    }
    Ok(schema)
}

/// Derive a schema name from a file path.
///
/// Example: `"schemas/real_estate.json"` → `"real_estate"`
pub fn derive_schema_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}
