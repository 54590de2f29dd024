use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Data-only description of what to extract from a page.
///
/// The core never inspects it; it is handed as-is to the
/// [`Extractor`](crate::traits::Extractor) collaborator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExtractionSchema {
    /// Human-readable schema name (e.g., "product_listing")
    #[serde(default)]
    pub name: String,
    pub fields: BTreeMap<String, FieldSpec>,
}

/// One output field: where to find it and how to post-process it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldSpec {
    pub selector: String,
    /// Read this attribute instead of the element text.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Collect every match instead of the first one.
    #[serde(default)]
    pub multiple: bool,
    /// Named processors applied in order (e.g. `["trim", "number"]`).
    #[serde(default)]
    pub processors: Vec<String>,
}

impl FieldSpec {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attribute: None,
            multiple: false,
            processors: Vec::new(),
        }
    }

    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn processor(mut self, name: impl Into<String>) -> Self {
        self.processors.push(name.into());
        self
    }
}

/// One extracted record, ready for export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Record {
    pub url: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// SHA-256 of the raw page body
    pub content_hash: String,
    pub scraped_at: DateTime<Utc>,
}

impl Record {
    /// Flatten into a single JSON object holding `url`, `scraped_at`,
    /// `content_hash` and the extracted fields.
    pub fn to_flat_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        out.insert("url".into(), self.url.clone().into());
        out.insert("scraped_at".into(), self.scraped_at.to_rfc3339().into());
        out.insert("content_hash".into(), self.content_hash.clone().into());
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_compute_hash_different_inputs() {
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_schema_from_json() {
        let schema: ExtractionSchema = serde_json::from_value(serde_json::json!({
            "name": "products",
            "fields": {
                "title": {"selector": "h1", "processors": ["trim"]},
                "links": {"selector": "a", "attribute": "href", "multiple": true}
            }
        }))
        .unwrap();

        assert_eq!(schema.fields.len(), 2);
        assert_eq!(
            schema.fields["links"],
            FieldSpec::new("a").attribute("href").multiple()
        );
        assert_eq!(schema.fields["title"].processors, vec!["trim"]);
    }

    #[test]
    fn test_flat_json_merges_metadata_and_fields() {
        let mut fields = serde_json::Map::new();
        fields.insert("title".into(), "Hello".into());
        let record = Record {
            url: "https://a.test/".into(),
            fields,
            content_hash: compute_hash("body"),
            scraped_at: Utc::now(),
        };
        let flat = record.to_flat_json();
        let keys: Vec<_> = flat.keys().cloned().collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(flat["title"], "Hello");
        assert_eq!(flat["url"], "https://a.test/");
    }
}
