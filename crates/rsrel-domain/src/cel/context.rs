//! Caveat parameter bindings.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use cel_interpreter::objects::Key;
use cel_interpreter::{Context, Value};

/// A caveat parameter value, already converted to its declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum CelValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<FixedOffset>),
    Duration(chrono::Duration),
    List(Vec<CelValue>),
    Map(HashMap<String, CelValue>),
}

impl CelValue {
    /// Converts untyped JSON, as bound to `any` parameters.
    ///
    /// Numbers become `Int` when they fit, then `UInt`, then `Float`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => CelValue::Null,
            Json::Bool(b) => CelValue::Bool(*b),
            Json::Number(n) => n
                .as_i64()
                .map(CelValue::Int)
                .or_else(|| n.as_u64().map(CelValue::UInt))
                .or_else(|| n.as_f64().map(CelValue::Float))
                .unwrap_or(CelValue::Null),
            Json::String(s) => CelValue::String(s.clone()),
            Json::Array(items) => CelValue::List(items.iter().map(Self::from_json).collect()),
            Json::Object(entries) => CelValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&CelValue> for Value {
    fn from(value: &CelValue) -> Self {
        match value {
            CelValue::Null => Value::Null,
            CelValue::Bool(b) => Value::Bool(*b),
            CelValue::Int(i) => Value::Int(*i),
            CelValue::UInt(u) => Value::UInt(*u),
            CelValue::Float(f) => Value::Float(*f),
            CelValue::String(s) => Value::String(s.clone().into()),
            CelValue::Bytes(b) => Value::Bytes(b.clone().into()),
            CelValue::Timestamp(ts) => Value::Timestamp(*ts),
            CelValue::Duration(d) => Value::Duration(*d),
            CelValue::List(items) => {
                Value::List(items.iter().map(Value::from).collect::<Vec<_>>().into())
            }
            CelValue::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (Key::String(k.clone().into()), Value::from(v)))
                    .collect::<HashMap<_, _>>()
                    .into(),
            ),
        }
    }
}

/// Parameter bindings for one caveat evaluation.
#[derive(Debug, Default, Clone)]
pub struct CelContext {
    bindings: HashMap<String, CelValue>,
}

impl CelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name`, replacing any earlier binding.
    pub fn bind(&mut self, name: impl Into<String>, value: CelValue) -> &mut Self {
        self.bindings.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CelValue> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub(crate) fn to_interpreter(&self) -> Context<'_> {
        let mut ctx = Context::default();
        for (name, value) in &self.bindings {
            ctx.add_variable_from_value(name.as_str(), Value::from(value));
        }
        ctx
    }
}

impl<K: Into<String>> FromIterator<(K, CelValue)> for CelContext {
    fn from_iter<I: IntoIterator<Item = (K, CelValue)>>(iter: I) -> Self {
        Self {
            bindings: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
