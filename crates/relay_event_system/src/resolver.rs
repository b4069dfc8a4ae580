//! Field access and pattern matching over decoded message data.
//!
//! Every inbound message is parsed into a [`serde_json::Value`] once, and the
//! routing layer asks two questions of it: "what is at this path?" and "does
//! this pattern hold?". Both live here.
//!
//! # Paths
//!
//! A path is either `*` (the whole value), a literal top-level key, or a
//! dotted walk through nested objects (`user.profile.name`). Empty segments
//! are skipped, so `a..b` is the same as `a.b`. Arrays and scalars are not
//! traversable.
//!
//! # Patterns
//!
//! A pattern is a conjunction of clauses joined with `&&`:
//!
//! * `path` - the field must exist
//! * `path=value` - loose equality against a literal
//! * `path=:type` / `path=!type` - the field must (or must not) be of a type
//!
//! Recognised type names are `null`, `num`/`number`/`numeric`,
//! `int`/`integer`, `float`, `bool`/`boolean`, `string`, `array` and
//! `object`, matched case-insensitively. The pattern `*` always matches and
//! an empty pattern never does.

use serde_json::{Map, Value};

/// Namespace for the path and pattern helpers.
///
/// All functions are pure and operate on borrowed data.
pub struct DataResolver;

impl DataResolver {
    /// Parses a raw message into a value.
    ///
    /// Anything that is not valid JSON, and a bare `null`, becomes an empty
    /// object so that routing code never has to special-case parse failures.
    pub fn parse(raw: &[u8]) -> Value {
        match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Null) | Err(_) => Value::Object(Map::new()),
            Ok(value) => value,
        }
    }

    /// Resolves `path` against `data`, returning `None` as soon as a segment
    /// is missing or the intermediate value is not an object.
    pub fn get<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
        if path == "*" {
            return Some(data);
        }

        if let Some(direct) = data.as_object().and_then(|map| map.get(path)) {
            return Some(direct);
        }

        if path.trim().is_empty() {
            return None;
        }

        let mut current = data;
        for segment in path.split('.') {
            if segment.trim().is_empty() {
                continue;
            }
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Like [`DataResolver::get`] but clones the result, falling back to
    /// `default` when the path does not resolve.
    pub fn get_or(data: &Value, path: &str, default: Value) -> Value {
        Self::get(data, path).cloned().unwrap_or(default)
    }

    /// Returns true when `path` resolves. A member explicitly set to `null`
    /// counts as present.
    pub fn has(data: &Value, path: &str) -> bool {
        Self::get(data, path).is_some()
    }

    /// Evaluates `pattern` against `data`.
    pub fn matches(data: &Value, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        let clauses = parse_clauses(pattern);
        if clauses.is_empty() {
            return false;
        }

        clauses.iter().all(|clause| match clause {
            Clause::Exists(path) => Self::has(data, path),
            Clause::Compare(path, expected) => match Self::get(data, path) {
                Some(value) => match_value(value, expected),
                None => false,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause<'a> {
    Exists(&'a str),
    Compare(&'a str, &'a str),
}

fn parse_clauses(pattern: &str) -> Vec<Clause<'_>> {
    pattern
        .split("&&")
        .filter(|raw| !raw.trim().is_empty())
        .filter_map(|raw| match raw.split_once('=') {
            Some((path, value)) => {
                let path = path.trim();
                if path.is_empty() {
                    None
                } else {
                    Some(Clause::Compare(path, value.trim()))
                }
            }
            None => Some(Clause::Exists(raw.trim())),
        })
        .collect()
}

/// A `:type` or `!type` guard from a pattern clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeGuard {
    Null,
    Numeric,
    Integer,
    Float,
    Boolean,
    String,
    Array,
    Object,
}

impl TypeGuard {
    /// Looks up a guard by its (case-insensitive) vocabulary name.
    pub fn from_name(name: &str) -> Option<Self> {
        let guard = match name.to_ascii_lowercase().as_str() {
            "null" => Self::Null,
            "num" | "number" | "numeric" => Self::Numeric,
            "int" | "integer" => Self::Integer,
            "float" => Self::Float,
            "bool" | "boolean" => Self::Boolean,
            "string" => Self::String,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => return None,
        };
        Some(guard)
    }

    /// Returns true when `value` is of this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Null => value.is_null(),
            Self::Numeric => match value {
                Value::Number(_) => true,
                Value::String(text) => is_numeric_str(text),
                _ => false,
            },
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_f64(),
            Self::Boolean => value.is_boolean(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

fn match_value(value: &Value, expected: &str) -> bool {
    let mut chars = expected.chars();
    if let Some(marker @ (':' | '!')) = chars.next() {
        if let Some(guard) = TypeGuard::from_name(chars.as_str()) {
            return guard.accepts(value) == (marker == ':');
        }
    }
    loose_eq(value, expected)
}

/// Coercive comparison of a JSON value with a pattern literal.
///
/// Numbers and numeric strings compare numerically, booleans compare by the
/// truthiness of the literal (`""` and `"0"` are false), `null` equals only
/// the empty literal, and containers never equal a literal.
pub fn loose_eq(value: &Value, literal: &str) -> bool {
    match value {
        Value::Null => literal.is_empty(),
        Value::Bool(flag) => *flag == !(literal.is_empty() || literal == "0"),
        Value::Number(number) => match (number.as_f64(), parse_numeric(literal)) {
            (Some(left), Some(right)) => left == right,
            _ => number.to_string() == literal,
        },
        Value::String(text) => match (parse_numeric(text), parse_numeric(literal)) {
            (Some(left), Some(right)) => left == right,
            _ => text == literal,
        },
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn parse_numeric(text: &str) -> Option<f64> {
    if is_numeric_str(text) {
        text.trim().parse::<f64>().ok()
    } else {
        None
    }
}

/// Decimal and exponent notation only: no `inf`, `nan` or hex.
fn is_numeric_str(text: &str) -> bool {
    let body = text.trim();
    let body = body.strip_prefix(['+', '-']).unwrap_or(body);
    if body.is_empty() {
        return false;
    }

    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(index) => (&body[..index], Some(&body[index + 1..])),
        None => (body, None),
    };

    let mut digits = 0;
    let mut dots = 0;
    for ch in mantissa.chars() {
        match ch {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    if digits == 0 || dots > 1 {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_walks_nested_objects() {
        let data = json!({"a": {"b": {"c": 7}}});
        assert_eq!(DataResolver::get(&data, "a.b.c"), Some(&json!(7)));
        assert_eq!(DataResolver::get(&data, "a..b.c"), Some(&json!(7)));
        assert_eq!(DataResolver::get(&data, "a.x"), None);
        assert_eq!(DataResolver::get(&data, "*"), Some(&data));
    }

    #[test]
    fn test_get_prefers_literal_key() {
        let data = json!({"a.b": 1, "a": {"b": 2}});
        assert_eq!(DataResolver::get(&data, "a.b"), Some(&json!(1)));
    }

    #[test]
    fn test_get_stops_at_non_objects() {
        let data = json!({"list": [1, 2, 3], "n": 4});
        assert_eq!(DataResolver::get(&data, "list.0"), None);
        assert_eq!(DataResolver::get(&data, "n.value"), None);
        assert_eq!(
            DataResolver::get_or(&data, "n.value", json!("fallback")),
            json!("fallback")
        );
    }

    #[test]
    fn test_parse_failure_yields_empty_object() {
        assert_eq!(DataResolver::parse(b"not json"), json!({}));
        assert_eq!(DataResolver::parse(b"null"), json!({}));
        assert_eq!(DataResolver::parse(b"[1,2]"), json!([1, 2]));
    }

    #[test]
    fn test_match_reference_cases() {
        assert!(DataResolver::matches(&json!({"a": {"b": 5}}), "a.b=5"));
        assert!(!DataResolver::matches(&json!({"a": "x"}), "a=:int"));
        assert!(DataResolver::matches(&json!({"a": 1}), "a=:int"));
        assert!(!DataResolver::matches(&json!({}), "missing"));
        assert!(DataResolver::matches(&json!("anything"), "*"));
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        assert!(!DataResolver::matches(&json!({"a": 1}), ""));
        assert!(!DataResolver::matches(&json!({"a": 1}), "  && "));
    }

    #[test]
    fn test_conjunction_requires_every_clause() {
        let data = json!({"type": "chat", "room": {"id": 3}});
        assert!(DataResolver::matches(&data, "type=chat && room.id=3"));
        assert!(!DataResolver::matches(&data, "type=chat && room.id=4"));
        assert!(!DataResolver::matches(&data, "type=chat && user"));
    }

    #[test]
    fn test_negated_and_case_insensitive_guards() {
        let data = json!({"l1": {"x": 1}, "n": 2.5, "s": "10"});
        assert!(DataResolver::matches(&data, "l1=:object"));
        assert!(DataResolver::matches(&data, "l1=!array"));
        assert!(DataResolver::matches(&data, "n=:FLOAT"));
        assert!(DataResolver::matches(&data, "s=:numeric"));
        assert!(!DataResolver::matches(&data, "s=:int"));
    }

    #[test]
    fn test_null_member_is_present() {
        let data = json!({"gone": null});
        assert!(DataResolver::has(&data, "gone"));
        assert!(DataResolver::matches(&data, "gone=:null"));
    }

    #[test]
    fn test_loose_equality() {
        assert!(loose_eq(&json!(5), "5.0"));
        assert!(loose_eq(&json!("1e1"), "10"));
        assert!(loose_eq(&json!(true), "yes"));
        assert!(loose_eq(&json!(false), "0"));
        assert!(!loose_eq(&json!(1), "one"));
        assert!(!loose_eq(&json!([1]), "1"));
    }

    #[test]
    fn test_unknown_guard_falls_back_to_literal() {
        assert!(DataResolver::matches(&json!({"tag": ":custom"}), "tag=:custom"));
    }
}
