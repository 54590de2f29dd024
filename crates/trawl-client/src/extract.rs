use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use trawl_core::error::AppError;
use trawl_core::models::{ExtractionSchema, FieldSpec};
use trawl_core::traits::Extractor;
use url::Url;

/// Processor names accepted in a field's `processors` list.
pub const PROCESSORS: &[&str] = &[
    "trim",
    "lowercase",
    "uppercase",
    "collapse_whitespace",
    "number",
    "strip_currency",
];

/// CSS-selector extractor built on `scraper`.
///
/// Element text is whitespace-trimmed. `href` and `src` attributes are
/// resolved against the page URL. A field with no match is `null`, or `[]`
/// when `multiple` is set.
#[derive(Debug, Clone, Default)]
pub struct CssExtractor;

impl CssExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Check selectors and processor names without fetching anything.
    pub fn check_schema(schema: &ExtractionSchema) -> Result<(), AppError> {
        for (name, spec) in &schema.fields {
            parse_selector(name, &spec.selector)?;
            if let Some(unknown) = spec.processors.iter().find(|p| !PROCESSORS.contains(&p.as_str())) {
                return Err(AppError::ExtractionError(format!(
                    "Field '{name}': unknown processor '{unknown}'"
                )));
            }
        }
        Ok(())
    }
}

impl Extractor for CssExtractor {
    fn extract(
        &self,
        body: &str,
        url: &str,
        schema: &ExtractionSchema,
    ) -> Result<Map<String, Value>, AppError> {
        let document = Html::parse_document(body);
        let base = Url::parse(url).ok();

        let mut out = Map::new();
        for (name, spec) in &schema.fields {
            let selector = parse_selector(name, &spec.selector)?;
            let mut values = Vec::new();
            for element in document.select(&selector) {
                let Some(raw) = read_element(element, spec, base.as_ref()) else {
                    continue;
                };
                values.push(apply_processors(name, Value::String(raw), &spec.processors)?);
                if !spec.multiple {
                    break;
                }
            }

            let value = if spec.multiple {
                Value::Array(values)
            } else {
                values.into_iter().next().unwrap_or(Value::Null)
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

fn parse_selector(field: &str, selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector).map_err(|e| {
        AppError::ExtractionError(format!("Field '{field}': invalid selector '{selector}': {e}"))
    })
}

fn read_element(element: ElementRef<'_>, spec: &FieldSpec, base: Option<&Url>) -> Option<String> {
    match spec.attribute.as_deref() {
        Some(attr) => {
            let value = element.value().attr(attr)?;
            if matches!(attr, "href" | "src") {
                if let Some(resolved) = base.and_then(|b| b.join(value).ok()) {
                    return Some(resolved.to_string());
                }
            }
            Some(value.to_string())
        }
        None => Some(element.text().collect::<String>().trim().to_string()),
    }
}

fn apply_processors(field: &str, mut value: Value, processors: &[String]) -> Result<Value, AppError> {
    for processor in processors {
        let Value::String(text) = &value else {
            // `number` output is final.
            break;
        };
        value = match processor.as_str() {
            "trim" => Value::String(text.trim().to_string()),
            "lowercase" => Value::String(text.to_lowercase()),
            "uppercase" => Value::String(text.to_uppercase()),
            "collapse_whitespace" => {
                Value::String(text.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            "strip_currency" => Value::String(strip_currency(text)),
            "number" => parse_number(text),
            other => {
                return Err(AppError::ExtractionError(format!(
                    "Field '{field}': unknown processor '{other}'"
                )));
            }
        };
    }
    Ok(value)
}

/// Drop currency symbols, codes and thousands separators: `"£1,299.50"` → `"1299.50"`.
fn strip_currency(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
        .collect()
}

/// Parse the first number in `text`, or `null` when there is none.
fn parse_number(text: &str) -> Value {
    let start = text.find(|c: char| c.is_ascii_digit() || c == '-' || c == '.');
    let Some(start) = start else {
        return Value::Null;
    };
    let candidate: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | ','))
        .filter(|c| *c != ',')
        .collect();

    if let Ok(int) = candidate.parse::<i64>() {
        return Value::from(int);
    }
    candidate
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
