//! Payload-shape strategies for turning raw API responses into flat records

use eyre::{Result, eyre};
use serde_json::Value;

/// Knows the shape of one endpoint's payloads.
///
/// A mapper does three jobs: locate the record list inside a response body,
/// surface the pagination hints the API embeds alongside it, and project each
/// raw record into an ordered list of column values. Implementations are small
/// value objects; [`FieldMapper`] covers the common "list of objects plus a
/// field projection" case, and bespoke APIs implement the trait directly.
pub trait RecordMapper: Send + Sync {
    /// Column names, in output order. Provenance columns are appended by the
    /// writer and must not be listed here.
    fn columns(&self) -> &[String];

    /// Extract the record list from a response body.
    ///
    /// # Errors
    /// Returns an error if the body does not contain a record list where this
    /// mapper expects one (a payload-shape defect, not a transient failure).
    fn records(&self, body: &Value) -> Result<Vec<Value>>;

    /// Explicit last-page signal embedded in the body, if the API has one.
    fn last_page_signal(&self, _body: &Value) -> Option<bool> {
        None
    }

    /// Cursor for the next page, if the API paginates by cursor.
    fn next_cursor(&self, _body: &Value) -> Option<String> {
        None
    }

    /// Project one raw record into `(column, value)` pairs in column order.
    fn map_raw(&self, raw: &Value) -> Result<Vec<(String, Value)>>;
}

/// One projected column: where it comes from and what to call it.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub column: String,
    /// Dot-separated path into the raw record, e.g. `contact.email`
    pub path: String,
}

impl FieldSpec {
    pub fn new(column: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            path: path.into(),
        }
    }

    /// A field whose column name is derived from its path.
    pub fn named(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            column: path.replace('.', "_"),
            path,
        }
    }
}

/// Generic mapper for APIs that return a list of JSON objects.
///
/// Configured entirely from data, so manifest-declared endpoints need no
/// bespoke code:
///
/// ```
/// use rest_harvester::endpoint::{FieldMapper, FieldSpec, RecordMapper};
/// use serde_json::json;
///
/// let mapper = FieldMapper::new(vec![
///     FieldSpec::named("id"),
///     FieldSpec::new("email", "contact.email"),
/// ])
/// .with_records_key("items");
///
/// let body = json!({"items": [{"id": 1, "contact": {"email": "a@b.c"}}]});
/// let records = mapper.records(&body).unwrap();
/// let pairs = mapper.map_raw(&records[0]).unwrap();
/// assert_eq!(pairs[1].0, "email");
/// ```
pub struct FieldMapper {
    fields: Vec<FieldSpec>,
    columns: Vec<String>,
    records_key: Option<String>,
    last_page_key: Option<String>,
    cursor_key: Option<String>,
}

impl FieldMapper {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        let columns = fields.iter().map(|f| f.column.clone()).collect();
        Self {
            fields,
            columns,
            records_key: None,
            last_page_key: None,
            cursor_key: None,
        }
    }

    /// Record list lives under this top-level key instead of being the body.
    pub fn with_records_key(mut self, key: impl Into<String>) -> Self {
        self.records_key = Some(key.into());
        self
    }

    /// Boolean field in the body that marks the final page.
    pub fn with_last_page_key(mut self, key: impl Into<String>) -> Self {
        self.last_page_key = Some(key.into());
        self
    }

    /// Field in the body carrying the cursor for the next page.
    pub fn with_cursor_key(mut self, key: impl Into<String>) -> Self {
        self.cursor_key = Some(key.into());
        self
    }
}

impl RecordMapper for FieldMapper {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn records(&self, body: &Value) -> Result<Vec<Value>> {
        let list = match &self.records_key {
            Some(key) => lookup(body, key)
                .ok_or_else(|| eyre!("response has no '{}' field", key))?,
            None => body,
        };

        list.as_array()
            .cloned()
            .ok_or_else(|| eyre!("expected a JSON array of records, got {}", type_name(list)))
    }

    fn last_page_signal(&self, body: &Value) -> Option<bool> {
        let key = self.last_page_key.as_deref()?;
        lookup(body, key)?.as_bool()
    }

    fn next_cursor(&self, body: &Value) -> Option<String> {
        let key = self.cursor_key.as_deref()?;
        match lookup(body, key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn map_raw(&self, raw: &Value) -> Result<Vec<(String, Value)>> {
        if !raw.is_object() {
            return Err(eyre!("expected a JSON object record, got {}", type_name(raw)));
        }

        Ok(self
            .fields
            .iter()
            .map(|field| {
                let value = lookup(raw, &field.path).cloned().unwrap_or(Value::Null);
                (field.column.clone(), value)
            })
            .collect())
    }
}

/// Walk a dot-separated path into a JSON value.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapper() -> FieldMapper {
        FieldMapper::new(vec![
            FieldSpec::named("id"),
            FieldSpec::new("email", "contact.email"),
            FieldSpec::named("plan"),
        ])
        .with_records_key("items")
        .with_last_page_key("is_last")
        .with_cursor_key("next_cursor")
    }

    #[test]
    fn test_records_under_key() {
        let body = json!({"items": [{"id": 1}, {"id": 2}], "is_last": false});
        let records = mapper().records(&body).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_records_as_bare_array() {
        let mapper = FieldMapper::new(vec![FieldSpec::named("id")]);
        let body = json!([{"id": 1}]);
        assert_eq!(mapper.records(&body).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_records_key_is_an_error() {
        let body = json!({"data": []});
        let err = mapper().records(&body).unwrap_err();
        assert!(err.to_string().contains("items"));
    }

    #[test]
    fn test_non_array_records_is_an_error() {
        let body = json!({"items": "oops"});
        assert!(mapper().records(&body).is_err());
    }

    #[test]
    fn test_map_raw_projects_in_column_order() {
        let raw = json!({
            "id": 42,
            "contact": {"email": "jo@example.com"},
            "plan": "pro",
            "ignored": true
        });

        let pairs = mapper().map_raw(&raw).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("id".to_string(), json!(42)));
        assert_eq!(pairs[1], ("email".to_string(), json!("jo@example.com")));
        assert_eq!(pairs[2], ("plan".to_string(), json!("pro")));
    }

    #[test]
    fn test_map_raw_fills_missing_fields_with_null() {
        let pairs = mapper().map_raw(&json!({"id": 1})).unwrap();
        assert_eq!(pairs[1].1, Value::Null);
        assert_eq!(pairs[2].1, Value::Null);
    }

    #[test]
    fn test_pagination_hints() {
        let m = mapper();
        let body = json!({"items": [], "is_last": true, "next_cursor": "abc"});
        assert_eq!(m.last_page_signal(&body), Some(true));
        assert_eq!(m.next_cursor(&body), Some("abc".to_string()));

        let body = json!({"items": [], "next_cursor": ""});
        assert_eq!(m.last_page_signal(&body), None);
        assert_eq!(m.next_cursor(&body), None);
    }

    #[test]
    fn test_numeric_cursor_is_stringified() {
        let m = mapper();
        let body = json!({"items": [], "next_cursor": 300});
        assert_eq!(m.next_cursor(&body), Some("300".to_string()));
    }
}
