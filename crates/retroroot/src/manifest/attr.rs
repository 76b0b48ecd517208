use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Str,
    Bool,
    Int,
    List,
    Object,
}

impl AttrType {
    pub fn of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_i64() || n.is_u64() => "int",
            Value::Number(_) => "float",
            Value::String(_) => "str",
            Value::Array(_) => "list",
            Value::Object(_) => "object",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AttrType::Str => "str",
            AttrType::Bool => "bool",
            AttrType::Int => "int",
            AttrType::List => "list",
            AttrType::Object => "object",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            AttrType::Str => value.is_string(),
            AttrType::Bool => value.is_boolean(),
            AttrType::Int => value.is_i64() || value.is_u64(),
            AttrType::List => value.is_array(),
            AttrType::Object => value.is_object(),
        }
    }
}

/// Type-checked lookup of `key` in a loosely-typed table.
///
/// Precedence: present and well-typed wins; present with the wrong type is an
/// error; absent with `fail` is an error; absent with a default (a `false`
/// default counts) yields the default; otherwise `(false, None)`.
pub fn parse_attr(
    container: &Map<String, Value>,
    key: &str,
    expected: AttrType,
    default: Option<Value>,
    fail: bool,
) -> Result<(bool, Option<Value>)> {
    if let Some(value) = container.get(key) {
        if expected.matches(value) {
            return Ok((true, Some(value.clone())));
        }
        return Err(Error::config(format!(
            "{key} is supposed to be {}, got {} instead",
            expected.name(),
            AttrType::of(value)
        )));
    }
    if fail {
        return Err(Error::config(format!(
            "mandatory attribute '{key}' is not defined"
        )));
    }
    match default {
        Some(v) => Ok((true, Some(v))),
        None => Ok((false, None)),
    }
}

pub fn parse_str(
    container: &Map<String, Value>,
    key: &str,
    default: Option<&str>,
    fail: bool,
) -> Result<Option<String>> {
    let (_, v) = parse_attr(
        container,
        key,
        AttrType::Str,
        default.map(|d| Value::String(d.to_string())),
        fail,
    )?;
    Ok(v.and_then(|v| v.as_str().map(ToOwned::to_owned)))
}

pub fn parse_bool(container: &Map<String, Value>, key: &str, default: bool) -> Result<bool> {
    let (_, v) = parse_attr(container, key, AttrType::Bool, Some(Value::Bool(default)), false)?;
    Ok(v.and_then(|v| v.as_bool()).unwrap_or(default))
}

// List of strings; every element is checked, not just the container.
pub fn parse_str_list(container: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    let (found, v) = parse_attr(container, key, AttrType::List, None, false)?;
    if !found {
        return Ok(Vec::new());
    }
    let items = v.and_then(|v| v.as_array().cloned()).unwrap_or_default();
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str().map(ToOwned::to_owned).ok_or_else(|| {
                Error::config(format!(
                    "{key}[{i}] is supposed to be str, got {} instead",
                    AttrType::of(item)
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn false_default_still_counts_as_given() {
        let got = parse_attr(&Map::new(), "x", AttrType::Bool, Some(json!(false)), false).unwrap();
        assert_eq!(got, (true, Some(json!(false))));
    }

    #[test]
    fn missing_without_default_is_not_found() {
        let got = parse_attr(&Map::new(), "x", AttrType::Bool, None, false).unwrap();
        assert_eq!(got, (false, None));
    }

    #[test]
    fn wrong_type_is_fatal() {
        let err = parse_attr(&table(json!({"x": 1})), "x", AttrType::Bool, None, false)
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("bool"), "{err}");
        assert!(err.to_string().contains("int"), "{err}");
    }

    #[test]
    fn missing_mandatory_is_fatal_even_with_default() {
        let err = parse_attr(&Map::new(), "defconfig", AttrType::Str, Some(json!("x")), true)
            .unwrap_err();
        assert!(err.to_string().contains("defconfig"), "{err}");
    }

    #[test]
    fn present_value_beats_default() {
        let got = parse_attr(
            &table(json!({"x": true})),
            "x",
            AttrType::Bool,
            Some(json!(false)),
            false,
        )
        .unwrap();
        assert_eq!(got, (true, Some(json!(true))));
    }

    #[test]
    fn string_lists_check_each_element() {
        let err = parse_str_list(&table(json!({"fragments": ["a", 3]})), "fragments").unwrap_err();
        assert!(err.to_string().contains("fragments[1]"), "{err}");
    }
}
