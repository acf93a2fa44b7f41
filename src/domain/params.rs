//! Parameter bags for signal rules and the schemas that validate them.
//!
//! Bags arrive either typed (built in code) or as raw strings (read from an
//! INI file). `validate_params` coerces both against a function's schema,
//! fills defaults, and rejects anything the schema does not declare.

use std::collections::BTreeMap;
use std::fmt;

use super::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Float,
    Str,
    Bool,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Int => "integer",
            ParamKind::Float => "number",
            ParamKind::Str => "string",
            ParamKind::Bool => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl ParamValue {
    /// Coerce into `kind`. Strings are parsed; integers widen to floats.
    pub fn coerce(&self, kind: ParamKind) -> Option<ParamValue> {
        match (kind, self) {
            (ParamKind::Int, ParamValue::Int(v)) => Some(ParamValue::Int(*v)),
            (ParamKind::Int, ParamValue::Str(s)) => s.trim().parse().ok().map(ParamValue::Int),
            (ParamKind::Float, ParamValue::Float(v)) => Some(ParamValue::Float(*v)),
            (ParamKind::Float, ParamValue::Int(v)) => Some(ParamValue::Float(*v as f64)),
            (ParamKind::Float, ParamValue::Str(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(ParamValue::Float),
            (ParamKind::Str, ParamValue::Str(s)) => Some(ParamValue::Str(s.trim().to_string())),
            (ParamKind::Bool, ParamValue::Bool(b)) => Some(ParamValue::Bool(*b)),
            (ParamKind::Bool, ParamValue::Str(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(ParamValue::Bool(true)),
                "false" | "no" | "0" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Named parameter values, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamBag {
    values: BTreeMap<String, ParamValue>,
}

impl ParamBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Integer parameter as a window length; negative values read as absent.
    pub fn get_usize(&self, name: &str) -> Option<usize> {
        self.get_int(name).and_then(|v| usize::try_from(v).ok())
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(ParamValue::as_number)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One declared parameter of a signal function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Raw default, parsed like a config value. `None` makes the parameter required.
    pub default: Option<&'static str>,
    /// Inclusive numeric bounds.
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Allowed values for string parameters; empty allows anything.
    pub choices: &'static [&'static str],
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        ParamSpec {
            name,
            kind,
            default: None,
            min: None,
            max: None,
            choices: &[],
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind, default: &'static str) -> Self {
        ParamSpec {
            name,
            kind,
            default: Some(default),
            min: None,
            max: None,
            choices: &[],
        }
    }

    pub const fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub const fn at_least(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub const fn one_of(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = choices;
        self
    }

    fn check(&self, rule: &str, value: &ParamValue) -> Result<(), BuildError> {
        let out_of_range = |reason: String| BuildError::ParameterRange {
            rule: rule.to_string(),
            param: self.name.to_string(),
            reason,
        };
        if let Some(n) = value.as_number() {
            if self.min.is_some_and(|min| n < min) {
                return Err(out_of_range(format!(
                    "{n} is below the minimum {}",
                    self.min.unwrap_or_default()
                )));
            }
            if self.max.is_some_and(|max| n > max) {
                return Err(out_of_range(format!(
                    "{n} is above the maximum {}",
                    self.max.unwrap_or_default()
                )));
            }
        }
        if let ParamValue::Str(s) = value {
            if !self.choices.is_empty() && !self.choices.contains(&s.as_str()) {
                return Err(out_of_range(format!(
                    "'{s}' is not one of {}",
                    self.choices.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Validate `raw` against `schema`, returning a bag with every declared
/// parameter present and correctly typed.
pub fn validate_params(
    rule: &str,
    raw: &ParamBag,
    schema: &[ParamSpec],
) -> Result<ParamBag, BuildError> {
    if let Some((unknown, _)) = raw.iter().find(|(k, _)| !schema.iter().any(|s| s.name == *k)) {
        return Err(BuildError::UnknownParameter {
            rule: rule.to_string(),
            param: unknown.to_string(),
        });
    }

    let mut validated = ParamBag::new();
    for spec in schema {
        let type_error = || BuildError::ParameterType {
            rule: rule.to_string(),
            param: spec.name.to_string(),
            expected: spec.kind.name(),
        };
        let value = match (raw.get(spec.name), spec.default) {
            (Some(value), _) => value.coerce(spec.kind).ok_or_else(type_error)?,
            (None, Some(default)) => ParamValue::from(default)
                .coerce(spec.kind)
                .ok_or_else(type_error)?,
            (None, None) => {
                return Err(BuildError::MissingParameter {
                    rule: rule.to_string(),
                    param: spec.name.to_string(),
                });
            }
        };
        spec.check(rule, &value)?;
        validated.values.insert(spec.name.to_string(), value);
    }
    Ok(validated)
}
