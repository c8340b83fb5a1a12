//! Deterministic JSON text for query arguments.
//!
//! Query arguments are plain JSON with one extension: regular expressions. A regex is written as
//! a string carrying [`REGEX_SENTINEL`] followed by its literal form (`/source/flags`), and any
//! string with that prefix is read back as a regex. Object keys keep the order the caller wrote
//! them in: `{"$sort": {"a": 1, "b": -1}}` and `{"$sort": {"b": -1, "a": 1}}` are different
//! queries and produce different text. That text feeds both the digest and the index file.

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

pub const REGEX_SENTINEL: &str = "__REGEXP ";

/// Object fields in insertion order.
pub type QueryObject = IndexMap<String, QueryValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<QueryValue>),
    Object(QueryObject),
    Regex(RegexValue),
}

/// A regular expression as written by the caller: source text plus flag letters.
///
/// Equality is textual. Two regexes that match the same language but are spelled differently
/// are different values and hash to different digests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegexValue {
    source: String,
    flags: String,
}

impl RegexValue {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    /// `/source/flags`
    pub fn literal(&self) -> String {
        format!("/{}/{}", self.source, self.flags)
    }

    /// Parses `/source/flags`. The source runs up to the last `/`, so slashes inside the
    /// pattern survive.
    pub fn parse_literal(literal: &str) -> Option<Self> {
        let rest = literal.strip_prefix('/')?;
        let end = rest.rfind('/')?;
        Some(Self::new(&rest[..end], &rest[end + 1..]))
    }

    fn encoded(&self) -> String {
        format!("{REGEX_SENTINEL}{}", self.literal())
    }

    /// Builds a matcher. Flags `i`, `m`, `s` and `x` are honoured; other flag letters are
    /// carried for hashing only.
    pub fn compile(&self) -> Result<Regex, regex::Error> {
        let mut builder = RegexBuilder::new(&self.source);
        for flag in self.flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                _ => {}
            }
        }
        builder.build()
    }
}

impl std::fmt::Display for RegexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

impl QueryValue {
    pub fn regex(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self::Regex(RegexValue::new(source, flags))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&QueryObject> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&QueryValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Plain JSON with regexes replaced by their sentinel strings.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Number(number) => Value::Number(number.clone()),
            Self::String(text) => Value::String(text.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Regex(regex) => Value::String(regex.encoded()),
        }
    }
}

fn decode_string(text: String) -> QueryValue {
    if let Some(literal) = text.strip_prefix(REGEX_SENTINEL)
        && let Some(regex) = RegexValue::parse_literal(literal)
    {
        return QueryValue::Regex(regex);
    }
    QueryValue::String(text)
}

impl From<Value> for QueryValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => decode_string(text),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&QueryValue> for Value {
    fn from(value: &QueryValue) -> Self {
        value.to_json()
    }
}

impl From<RegexValue> for QueryValue {
    fn from(regex: RegexValue) -> Self {
        Self::Regex(regex)
    }
}

impl From<&str> for QueryValue {
    fn from(text: &str) -> Self {
        Self::String(text.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(text: String) -> Self {
        Self::String(text)
    }
}

impl From<Vec<QueryValue>> for QueryValue {
    fn from(items: Vec<QueryValue>) -> Self {
        Self::Array(items)
    }
}

impl Serialize for QueryValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(flag) => serializer.serialize_bool(*flag),
            Self::Number(number) => number.serialize(serializer),
            Self::String(text) => serializer.serialize_str(text),
            Self::Array(items) => items.serialize(serializer),
            Self::Object(map) => map.serialize(serializer),
            Self::Regex(regex) => serializer.serialize_str(&regex.encoded()),
        }
    }
}

impl<'de> Deserialize<'de> for QueryValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

/// Pretty JSON, two-space indent, keys in insertion order.
pub fn to_string(value: &QueryValue) -> String {
    format!("{:#}", value.to_json())
}

pub fn from_str(text: &str) -> Result<QueryValue, serde_json::Error> {
    serde_json::from_str::<Value>(text).map(QueryValue::from)
}
