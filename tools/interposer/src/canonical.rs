//! Call identities and their canonical, hashable form.
//!
//! A call is identified by its method name, positional and keyword
//! arguments, and channel. [`canonical_identity`] reduces that to a JSON value
//! built only from strings, numbers, booleans, null, arrays, and objects with
//! sorted keys; [`parameter_hash`] digests the serialized bytes. Two calls are
//! the same request iff their canonical bytes are identical.

use crate::errors::InterposerError;
use crate::store::FormatVersion;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Extension kinds may encode into other extension kinds; this bounds it.
const MAX_ENCODE_DEPTH: usize = 16;

/// One argument value as handed to an intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    /// Unsigned values beyond `i64::MAX`.
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<Param>),
    Map(BTreeMap<String, Param>),
    Timestamp(DateTime<Utc>),
    /// An enumerated constant; canonicalizes to its underlying value.
    Enum { name: String, value: Box<Param> },
    /// Anything else. Fails canonicalization unless an encoder accepts `kind`.
    Opaque { kind: String, repr: String },
}

impl Param {
    pub fn enumerated(name: impl Into<String>, value: impl Into<Param>) -> Self {
        Self::Enum {
            name: name.into(),
            value: Box::new(value.into()),
        }
    }

    pub fn opaque(kind: impl Into<String>, repr: impl Into<String>) -> Self {
        Self::Opaque {
            kind: kind.into(),
            repr: repr.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Timestamp(_) => "timestamp",
            Self::Enum { .. } => "enum",
            Self::Opaque { kind, .. } => kind.as_str(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Apply `f` to every string inside this value, depth first.
    pub fn map_strings(self, f: &dyn Fn(String) -> String) -> Self {
        match self {
            Self::Str(value) => Self::Str(f(value)),
            Self::List(items) => Self::List(items.into_iter().map(|p| p.map_strings(f)).collect()),
            Self::Map(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, value.map_strings(f)))
                    .collect(),
            ),
            Self::Enum { name, value } => Self::Enum {
                name,
                value: Box::new(value.map_strings(f)),
            },
            other => other,
        }
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Param {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for Param {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::UInt(value), Self::Int)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<DateTime<Utc>> for Param {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Param>> From<Vec<T>> for Param {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Self::Int(i),
                (None, Some(u)) => Self::UInt(u),
                (None, None) => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s),
            Value::Array(items) => Self::List(items.into_iter().map(Param::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Param::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    pub args: Vec<Param>,
    pub kwargs: BTreeMap<String, Param>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Param>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Param>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self, index: usize) -> Option<&Param> {
        self.args.get(index)
    }

    pub fn keyword(&self, name: &str) -> Option<&Param> {
        self.kwargs.get(name)
    }
}

/// The identity of one intercepted call, before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub struct CallIdentity {
    pub method: String,
    pub args: Vec<Param>,
    pub kwargs: BTreeMap<String, Param>,
    pub channel: String,
}

impl CallIdentity {
    pub fn new(method: impl Into<String>, arguments: &Arguments, channel: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: arguments.args.clone(),
            kwargs: arguments.kwargs.clone(),
            channel: channel.into(),
        }
    }

    /// Apply `f` to every string argument, leaving method and channel alone.
    pub fn map_strings(self, f: &dyn Fn(String) -> String) -> Self {
        Self {
            method: self.method,
            args: self.args.into_iter().map(|p| p.map_strings(f)).collect(),
            kwargs: self
                .kwargs
                .into_iter()
                .map(|(key, value)| (key, value.map_strings(f)))
                .collect(),
            channel: self.channel,
        }
    }
}

/// Canonicalization extension for values outside the primitive set.
///
/// Implementations return a simpler [`Param`] for kinds they understand and a
/// `Canonicalization` error otherwise.
pub trait ParamEncoder: Send + Sync {
    fn encode(&self, param: &Param) -> Result<Param, InterposerError>;
}

/// Timestamps become RFC 3339 strings, enums become their value.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardEncoder;

impl ParamEncoder for StandardEncoder {
    fn encode(&self, param: &Param) -> Result<Param, InterposerError> {
        match param {
            Param::Timestamp(at) => Ok(Param::Str(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
            Param::Enum { value, .. } => Ok((**value).clone()),
            other => Err(InterposerError::Canonicalization {
                kind: other.kind().to_string(),
            }),
        }
    }
}

/// Reduce one argument value to canonical JSON.
pub fn canonicalize(
    param: &Param,
    format: FormatVersion,
    encoder: &dyn ParamEncoder,
) -> Result<Value, InterposerError> {
    canonicalize_at(param, format, encoder, 0)
}

fn canonicalize_at(
    param: &Param,
    format: FormatVersion,
    encoder: &dyn ParamEncoder,
    depth: usize,
) -> Result<Value, InterposerError> {
    match param {
        Param::Null => Ok(Value::Null),
        Param::Bool(value) => Ok(Value::Bool(*value)),
        Param::Int(value) => Ok(Value::Number(Number::from(*value))),
        Param::UInt(value) => Ok(Value::Number(Number::from(*value))),
        Param::Float(value) => Number::from_f64(*value)
            .map(Value::Number)
            .ok_or_else(|| InterposerError::Canonicalization {
                kind: "non-finite float".to_string(),
            }),
        Param::Str(value) => Ok(Value::String(value.clone())),
        Param::List(items) => items
            .iter()
            .map(|item| canonicalize_at(item, format, encoder, depth))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Param::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), canonicalize_at(value, format, encoder, depth)?);
            }
            Ok(Value::Object(map))
        }
        extended => {
            let extensions_allowed = match extended {
                Param::Timestamp(_) | Param::Enum { .. } => format.encodes_extended_params(),
                _ => true,
            };
            if !extensions_allowed || depth >= MAX_ENCODE_DEPTH {
                return Err(InterposerError::Canonicalization {
                    kind: extended.kind().to_string(),
                });
            }
            let encoded = encoder.encode(extended)?;
            canonicalize_at(&encoded, format, encoder, depth + 1)
        }
    }
}

/// The canonical form of a whole call identity.
///
/// Formats before 3 label the channel `context`.
pub fn canonical_identity(
    call: &CallIdentity,
    format: FormatVersion,
    encoder: &dyn ParamEncoder,
) -> Result<Value, InterposerError> {
    let args = call
        .args
        .iter()
        .map(|arg| canonicalize(arg, format, encoder))
        .collect::<Result<Vec<_>, _>>()?;
    let mut kwargs = Map::new();
    for (key, value) in &call.kwargs {
        kwargs.insert(key.clone(), canonicalize(value, format, encoder)?);
    }

    let mut identity = Map::new();
    identity.insert("method".to_string(), Value::String(call.method.clone()));
    identity.insert("args".to_string(), Value::Array(args));
    identity.insert("kwargs".to_string(), Value::Object(kwargs));
    identity.insert(
        format.channel_label().to_string(),
        Value::String(call.channel.clone()),
    );
    Ok(Value::Object(identity))
}

/// Serialize with every object's keys in lexicographic order.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, InterposerError> {
    serde_json::to_vec(&sort_keys(value)).map_err(|e| InterposerError::Canonicalization {
        kind: e.to_string(),
    })
}

pub fn parameter_hash(canonical: &Value) -> Result<String, InterposerError> {
    let bytes = canonical_bytes(canonical)?;
    let mut digest = Sha256::new();
    digest.update(&bytes);
    let hashed = digest.finalize();
    let mut out = String::with_capacity(hashed.len() * 2);
    for byte in hashed {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        Value::Object(entries) => {
            let mut keys = entries.keys().collect::<Vec<_>>();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(inner) = entries.get(key) {
                    sorted.insert(key.clone(), sort_keys(inner));
                }
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}
