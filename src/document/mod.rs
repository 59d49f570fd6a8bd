use crate::error::{Error, Result};
use crate::query::{Select, Where, WhereOp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A JSON document: an ordered mapping of string keys to JSON values.
///
/// Nested access uses dotted paths (`contact.email`). Documents round-trip
/// through JSON bytes and clone into value-independent copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    value: Value,
}

impl Default for Document {
    fn default() -> Self {
        Document::new()
    }
}

impl Document {
    /// An empty document (`{}`).
    pub fn new() -> Self {
        Document {
            value: Value::Object(Map::new()),
        }
    }

    /// Wrap a JSON value. Fails unless the value is an object.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::Validation(
                "document must be a json object".to_string(),
            ));
        }
        Ok(Document { value })
    }

    /// Parse a document from raw JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Document::from_value(value)
    }

    /// Build a document from any serializable value that maps to an object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Document::from_value(serde_json::to_value(value)?)
    }

    /// The document as JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.value)?)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    fn as_object(&self) -> &Map<String, Value> {
        // invariant: self.value is always an object
        self.value.as_object().expect("document holds a json object")
    }

    pub fn is_empty(&self) -> bool {
        self.as_object().is_empty()
    }

    /// Get a field by dotted path. Numeric path segments index into arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.value;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Get a field by dotted path, cloning. Missing fields yield `Null`.
    pub fn get_value(&self, path: &str) -> Value {
        self.get(path).cloned().unwrap_or(Value::Null)
    }

    /// String coercion: strings as-is, numbers/bools via display, null empty.
    pub fn get_string(&self, path: &str) -> String {
        match self.get(path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Numeric coercion: non-numbers read as 0.
    pub fn get_f64(&self, path: &str) -> f64 {
        match self.get(path) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::Bool(true)) => 1.0,
            _ => 0.0,
        }
    }

    pub fn get_bool(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Bool(true)))
    }

    /// Set a field by dotted path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        if path.is_empty() {
            return Err(Error::Validation("empty field path".to_string()));
        }
        let mut current = self
            .value
            .as_object_mut()
            .expect("document holds a json object");
        let segments: Vec<&str> = path.split('.').collect();
        for segment in &segments[..segments.len() - 1] {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().expect("entry was made an object");
        }
        current.insert(segments[segments.len() - 1].to_string(), value);
        Ok(())
    }

    /// Set every entry of a flattened (dotted-path) map.
    pub fn set_all(&mut self, values: Map<String, Value>) -> Result<()> {
        for (path, value) in values {
            self.set(&path, value)?;
        }
        Ok(())
    }

    /// Delete a field by dotted path. Missing paths are a no-op.
    pub fn del(&mut self, path: &str) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = match self.value.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        for segment in &segments[..segments.len() - 1] {
            current = match current.get_mut(*segment).and_then(Value::as_object_mut) {
                Some(map) => map,
                None => return,
            };
        }
        current.remove(segments[segments.len() - 1]);
    }

    /// Flatten nested objects into a dotted-path map. Arrays stay as leaf
    /// values, so merging a flattened patch replaces arrays wholesale.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut flat = Map::new();
        flatten_into("", &self.value, &mut flat);
        flat
    }

    /// Deep partial merge: every leaf of `patch` overwrites the matching path
    /// of this document, leaving unrelated fields untouched.
    pub fn merge(&mut self, patch: &Document) -> Result<()> {
        self.set_all(patch.flatten())
    }

    /// Project into a new document containing only the selected fields under
    /// their aliases.
    pub fn project(&self, selects: &[Select]) -> Result<Document> {
        let mut projected = Document::new();
        for select in selects {
            if select.field == "*" {
                return Ok(self.clone());
            }
            projected.set(&select.alias(), self.get_value(&select.field))?;
        }
        Ok(projected)
    }

    /// Evaluate a where-clause list; every clause must pass.
    pub fn matches_where(&self, wheres: &[Where]) -> Result<bool> {
        for clause in wheres {
            let field = self.get_value(&clause.field);
            let pass = match clause.op {
                WhereOp::Eq => values_equal(&field, &clause.value),
                WhereOp::Neq => !values_equal(&field, &clause.value),
                WhereOp::Gt => self.get_f64(&clause.field) > number_of(&clause.value),
                WhereOp::Gte => self.get_f64(&clause.field) >= number_of(&clause.value),
                WhereOp::Lt => self.get_f64(&clause.field) < number_of(&clause.value),
                WhereOp::Lte => self.get_f64(&clause.field) <= number_of(&clause.value),
                WhereOp::In => match &clause.value {
                    Value::Array(options) => {
                        options.iter().any(|option| values_equal(&field, option))
                    }
                    _ => {
                        return Err(Error::Validation(format!(
                            "where op 'in' requires an array value for field {}",
                            clause.field
                        )))
                    }
                },
                WhereOp::Contains => match &field {
                    Value::Array(items) => {
                        items.iter().any(|item| values_equal(item, &clause.value))
                    }
                    _ => self
                        .get_string(&clause.field)
                        .contains(&string_of(&clause.value)),
                },
            };
            if !pass {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            if map.is_empty() && !prefix.is_empty() {
                out.insert(prefix.to_string(), value.clone());
                return;
            }
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, nested, out);
            }
        }
        _ => {
            out.insert(prefix.to_string(), value.clone());
        }
    }
}

/// Equality with numeric normalization: `1` and `1.0` compare equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        _ => a == b,
    }
}

fn number_of(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Total order over JSON values used for sorts:
/// null < false < true < numbers < strings < arrays < objects.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> Document {
        Document::from_value(json!({
            "_id": "a",
            "name": "Alice",
            "age": 31,
            "active": true,
            "contact": {"email": "alice@test.com", "phone": "555"},
            "tags": ["admin", "staff"],
        }))
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let doc = user();
        let parsed = Document::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(doc, parsed);
    }

    #[test]
    fn test_rejects_non_objects() {
        assert!(Document::from_value(json!([1, 2])).is_err());
        assert!(Document::from_bytes(b"3").is_err());
    }

    #[test]
    fn test_dotted_get() {
        let doc = user();
        assert_eq!(doc.get_string("contact.email"), "alice@test.com");
        assert_eq!(doc.get_value("tags.1"), json!("staff"));
        assert_eq!(doc.get_value("contact.missing"), Value::Null);
        assert_eq!(doc.get_f64("age"), 31.0);
    }

    #[test]
    fn test_dotted_set_creates_intermediates() {
        let mut doc = Document::new();
        doc.set("contact.address.city", json!("Oslo")).unwrap();
        assert_eq!(doc.get_value("contact.address.city"), json!("Oslo"));
    }

    #[test]
    fn test_clone_is_value_independent() {
        let mut doc = user();
        let copy = doc.clone();
        doc.set("name", json!("Mallory")).unwrap();
        assert_eq!(copy.get_string("name"), "Alice");
    }

    #[test]
    fn test_flatten_and_merge() {
        let doc = user();
        let flat = doc.flatten();
        assert_eq!(flat.get("contact.email"), Some(&json!("alice@test.com")));
        // arrays stay as leaves
        assert_eq!(flat.get("tags"), Some(&json!(["admin", "staff"])));

        let mut target = user();
        let patch =
            Document::from_value(json!({"contact": {"email": "new@test.com"}})).unwrap();
        target.merge(&patch).unwrap();
        assert_eq!(target.get_string("contact.email"), "new@test.com");
        // sibling field survives the partial merge
        assert_eq!(target.get_string("contact.phone"), "555");
    }

    #[test]
    fn test_del() {
        let mut doc = user();
        doc.del("contact.phone");
        assert_eq!(doc.get_value("contact.phone"), Value::Null);
        assert_eq!(doc.get_string("contact.email"), "alice@test.com");
    }

    #[test]
    fn test_where_operators() {
        let doc = user();
        let clause = |field: &str, op: WhereOp, value: Value| Where {
            field: field.into(),
            op,
            value,
        };
        assert!(doc
            .matches_where(&[clause("contact.email", WhereOp::Eq, json!("alice@test.com"))])
            .unwrap());
        assert!(doc
            .matches_where(&[clause("age", WhereOp::Eq, json!(31.0))])
            .unwrap());
        assert!(!doc
            .matches_where(&[clause("age", WhereOp::Neq, json!(31))])
            .unwrap());
        assert!(doc.matches_where(&[clause("age", WhereOp::Gt, json!(30))]).unwrap());
        assert!(!doc.matches_where(&[clause("age", WhereOp::Lt, json!(31))]).unwrap());
        assert!(doc
            .matches_where(&[clause("age", WhereOp::In, json!([30, 31]))])
            .unwrap());
        assert!(doc
            .matches_where(&[clause("name", WhereOp::Contains, json!("lic"))])
            .unwrap());
        assert!(doc
            .matches_where(&[clause("tags", WhereOp::Contains, json!("admin"))])
            .unwrap());
        assert!(doc
            .matches_where(&[clause("age", WhereOp::In, json!(31))])
            .is_err());
    }

    #[test]
    fn test_projection_with_alias() {
        let doc = user();
        let selects = vec![
            Select {
                field: "contact.email".into(),
                alias: Some("email".into()),
                aggregate: None,
            },
            Select {
                field: "name".into(),
                alias: None,
                aggregate: None,
            },
        ];
        let projected = doc.project(&selects).unwrap();
        assert_eq!(projected.get_string("email"), "alice@test.com");
        assert_eq!(projected.get_string("name"), "Alice");
        assert_eq!(projected.get_value("age"), Value::Null);
    }

    #[test]
    fn test_value_ordering() {
        let ordered = [
            Value::Null,
            json!(false),
            json!(true),
            json!(-3),
            json!(2.5),
            json!("a"),
            json!("b"),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less);
        }
    }
}
