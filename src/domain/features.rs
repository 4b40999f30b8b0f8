use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel used for features whose value could not be computed, and for
/// "no prior transaction".
pub const UNKNOWN: i64 = -1;

/// A single feature value.
///
/// Variant order matters for untagged deserialization: integers must be tried
/// before floats so that snapshots round-trip to the same variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FeatureValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            FeatureValue::Float(v) => Some(*v as i64),
            FeatureValue::Bool(v) => Some(i64::from(*v)),
            FeatureValue::Text(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Int(v) => Some(*v as f64),
            FeatureValue::Float(v) => Some(*v),
            FeatureValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            FeatureValue::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FeatureValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Int(v)
    }
}

impl From<u64> for FeatureValue {
    fn from(v: u64) -> Self {
        FeatureValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for FeatureValue {
    fn from(v: u32) -> Self {
        FeatureValue::Int(i64::from(v))
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        // JSON has no NaN/inf; keep snapshots serializable.
        if v.is_finite() {
            FeatureValue::Float(v)
        } else {
            FeatureValue::Int(UNKNOWN)
        }
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Text(v)
    }
}

/// Flat name→value mapping produced once per pipeline run.
///
/// Backed by a `BTreeMap` so the JSON audit snapshot has a stable key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeMap<String, FeatureValue>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.0.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(FeatureValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(FeatureValue::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(FeatureValue::as_bool)
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(FeatureValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FeatureValue)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
