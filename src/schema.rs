//! Service data schemas.
//!
//! A [`ServiceSchema`] is a flat list of [`Field`]s. Validation coerces
//! values into their canonical JSON shape, fills in defaults and rejects
//! anything the schema does not name.

use serde_json::{Map, Value};
use thiserror::Error;

pub const ATTR_ENTITY_ID: &str = "entity_id";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("required key not provided: {0}")]
    MissingField(String),

    #[error("extra keys not allowed: {0}")]
    UnknownField(String),

    #[error("expected {expected} for {field}, got {value}")]
    WrongType {
        field: String,
        expected: &'static str,
        value: Value,
    },

    #[error("value {value} for {field} must be between {min} and {max}")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("value {value:?} for {field} must be one of {allowed:?}")]
    InvalidChoice {
        field: String,
        value: String,
        allowed: Vec<&'static str>,
    },

    #[error("invalid entity id {0:?}")]
    InvalidEntityId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Integer in `min..=max`. Numeric strings and floats are coerced
    /// (floats truncate toward zero).
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    OneOf(&'static [&'static str]),
    /// One or more `domain.object_id` ids: a string, a comma-separated
    /// string or an array. Normalized to a lowercase array.
    EntityIds,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Presence {
    Required,
    Optional,
    Default(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub presence: Presence,
}

impl Field {
    pub fn int(name: &'static str, min: i64, max: i64) -> Self {
        Self::new(name, FieldKind::Int { min, max })
    }

    pub fn float(name: &'static str, min: f64, max: f64) -> Self {
        Self::new(name, FieldKind::Float { min, max })
    }

    pub fn one_of(name: &'static str, allowed: &'static [&'static str]) -> Self {
        Self::new(name, FieldKind::OneOf(allowed))
    }

    pub fn entity_ids(name: &'static str) -> Self {
        Self::new(name, FieldKind::EntityIds)
    }

    fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            presence: Presence::Optional,
        }
    }

    pub fn required(mut self) -> Self {
        self.presence = Presence::Required;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.presence = Presence::Default(value.into());
        self
    }

    fn coerce(&self, value: &Value) -> Result<Value, SchemaError> {
        match &self.kind {
            FieldKind::Int { min, max } => {
                let n = as_i64(value).ok_or_else(|| self.wrong_type("an integer", value))?;
                if n < *min || n > *max {
                    return Err(self.out_of_range(n, min, max));
                }
                Ok(Value::from(n))
            }
            FieldKind::Float { min, max } => {
                let f = as_f64(value).ok_or_else(|| self.wrong_type("a number", value))?;
                if !(f >= *min && f <= *max) {
                    return Err(self.out_of_range(f, min, max));
                }
                Ok(Value::from(f))
            }
            FieldKind::OneOf(allowed) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| self.wrong_type("a string", value))?;
                if !allowed.contains(&s) {
                    return Err(SchemaError::InvalidChoice {
                        field: self.name.to_string(),
                        value: s.to_string(),
                        allowed: allowed.to_vec(),
                    });
                }
                Ok(Value::from(s))
            }
            FieldKind::EntityIds => {
                let raw = raw_entity_ids(value).ok_or_else(|| self.wrong_type("entity ids", value))?;
                let ids = raw
                    .into_iter()
                    .map(|id| {
                        let id = id.to_lowercase();
                        if valid_entity_id(&id) {
                            Ok(id)
                        } else {
                            Err(SchemaError::InvalidEntityId(id))
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::from(ids))
            }
        }
    }

    fn wrong_type(&self, expected: &'static str, value: &Value) -> SchemaError {
        SchemaError::WrongType {
            field: self.name.to_string(),
            expected,
            value: value.clone(),
        }
    }

    fn out_of_range<T: ToString>(&self, value: T, min: &T, max: &T) -> SchemaError {
        SchemaError::OutOfRange {
            field: self.name.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceSchema {
    fields: Vec<Field>,
}

impl ServiceSchema {
    /// Schema that accepts no data at all.
    #[cfg(test)]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Schema for a service that targets entities: an optional
    /// `entity_id` plus whatever `fields` the command takes.
    pub fn entity_service(fields: Vec<Field>) -> Self {
        let mut schema = Self::default().field(Field::entity_ids(ATTR_ENTITY_ID));
        for f in fields {
            schema = schema.field(f);
        }
        schema
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.retain(|f| f.name != field.name);
        self.fields.push(field);
        self
    }

    pub fn validate(&self, data: &Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
        if let Some(extra) = data
            .keys()
            .find(|k| !self.fields.iter().any(|f| f.name == k.as_str()))
        {
            return Err(SchemaError::UnknownField(extra.clone()));
        }

        let mut out = Map::new();
        for field in &self.fields {
            match (data.get(field.name), &field.presence) {
                (Some(v), _) => {
                    out.insert(field.name.to_string(), field.coerce(v)?);
                }
                (None, Presence::Default(default)) => {
                    out.insert(field.name.to_string(), default.clone());
                }
                (None, Presence::Required) => {
                    return Err(SchemaError::MissingField(field.name.to_string()));
                }
                (None, Presence::Optional) => {}
            }
        }
        Ok(out)
    }

    /// Field listing in the shape `get_services` reports.
    pub fn describe(&self) -> Value {
        let mut fields = Map::new();
        for f in &self.fields {
            let mut entry = Map::new();
            entry.insert("required".into(), Value::from(f.presence == Presence::Required));
            if let Presence::Default(v) = &f.presence {
                entry.insert("default".into(), v.clone());
            }
            let selector = match &f.kind {
                FieldKind::Int { min, max } => {
                    serde_json::json!({"number": {"min": min, "max": max, "step": 1}})
                }
                FieldKind::Float { min, max } => {
                    serde_json::json!({"number": {"min": min, "max": max}})
                }
                FieldKind::OneOf(allowed) => serde_json::json!({"select": {"options": allowed}}),
                FieldKind::EntityIds => serde_json::json!({"entity": {"multiple": true}}),
            };
            entry.insert("selector".into(), selector);
            fields.insert(f.name.to_string(), Value::Object(entry));
        }
        Value::Object(fields)
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// Ids as given, split and trimmed; `None` when the value has the wrong shape.
fn raw_entity_ids(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(s.split(',').map(|p| p.trim().to_string()).collect()),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(|s| s.trim().to_string()))
            .collect(),
        _ => None,
    }
}

fn valid_entity_id(id: &str) -> bool {
    let valid_part = |p: &str| {
        !p.is_empty()
            && p.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    match id.split_once('.') {
        Some((domain, object_id)) => valid_part(domain) && valid_part(object_id),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn goto_schema() -> ServiceSchema {
        ServiceSchema::entity_service(vec![
            Field::int("brightness_pct", 0, 100).required(),
            Field::int("rate", -1, 255).default(-1),
        ])
    }

    #[test]
    fn test_defaults_are_filled() {
        let out = goto_schema()
            .validate(&obj(json!({"brightness_pct": 40})))
            .unwrap();
        assert_eq!(out, obj(json!({"brightness_pct": 40, "rate": -1})));
    }

    #[test]
    fn test_int_coercion() {
        let out = goto_schema()
            .validate(&obj(json!({"brightness_pct": "55", "rate": 2.9})))
            .unwrap();
        assert_eq!(out["brightness_pct"], 55);
        assert_eq!(out["rate"], 2);
    }

    #[test]
    fn test_missing_required_field() {
        let err = goto_schema().validate(&Map::new()).unwrap_err();
        assert_eq!(err, SchemaError::MissingField("brightness_pct".into()));
    }

    #[test]
    fn test_out_of_range() {
        let err = goto_schema()
            .validate(&obj(json!({"brightness_pct": 101})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::OutOfRange { ref field, .. } if field == "brightness_pct"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ServiceSchema::empty()
            .validate(&obj(json!({"bogus": 1})))
            .unwrap_err();
        assert_eq!(err, SchemaError::UnknownField("bogus".into()));
    }

    #[test]
    fn test_entity_ids_normalized() {
        let schema = ServiceSchema::entity_service(vec![]);
        let out = schema
            .validate(&obj(json!({"entity_id": "Light.Kitchen, light.hall"})))
            .unwrap();
        assert_eq!(out["entity_id"], json!(["light.kitchen", "light.hall"]));

        let out = schema
            .validate(&obj(json!({"entity_id": ["scene.evening"]})))
            .unwrap();
        assert_eq!(out["entity_id"], json!(["scene.evening"]));
    }

    #[test]
    fn test_bad_entity_id() {
        let schema = ServiceSchema::entity_service(vec![]);
        assert_eq!(
            schema.validate(&obj(json!({"entity_id": "light.kitchen, Kitchen"}))),
            Err(SchemaError::InvalidEntityId("kitchen".into()))
        );
        assert!(matches!(
            schema.validate(&obj(json!({"entity_id": [7]}))),
            Err(SchemaError::WrongType { .. })
        ));
    }

    #[test]
    fn test_one_of_and_float() {
        let schema = ServiceSchema::entity_service(vec![
            Field::one_of("flash", &["short", "long"]),
            Field::float("transition", 0.0, 6553.0),
        ]);
        let out = schema
            .validate(&obj(json!({"flash": "long", "transition": "1.5"})))
            .unwrap();
        assert_eq!(out["flash"], "long");
        assert_eq!(out["transition"], 1.5);
        assert!(matches!(
            schema.validate(&obj(json!({"flash": "strobe"}))),
            Err(SchemaError::InvalidChoice { .. })
        ));
        assert!(schema.validate(&obj(json!({"transition": -1}))).is_err());
    }

    #[test]
    fn test_describe_lists_fields() {
        let desc = goto_schema().describe();
        assert_eq!(desc["brightness_pct"]["required"], true);
        assert_eq!(desc["rate"]["default"], -1);
        assert!(desc["entity_id"]["selector"]["entity"].is_object());
    }
}
