//! Conversion between record field values and Loro values.

use std::collections::HashMap;

use loro::LoroValue;
use serde_json::{Number, Value};

pub(crate) fn json_to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Null => LoroValue::Null,
        Value::Bool(b) => LoroValue::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LoroValue::from(i),
            None => LoroValue::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => LoroValue::from(s.as_str()),
        Value::Array(items) => LoroValue::from(items.iter().map(json_to_loro).collect::<Vec<_>>()),
        Value::Object(map) => LoroValue::from(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_loro(v)))
                .collect::<HashMap<String, LoroValue>>(),
        ),
    }
}

pub(crate) fn loro_to_json(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::I64(i) => Value::Number((*i).into()),
        LoroValue::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::List(items) => Value::Array(items.iter().map(loro_to_json).collect()),
        LoroValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), loro_to_json(v)))
                .collect(),
        ),
        LoroValue::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_keep_their_number_kind() {
        for value in [json!(null), json!(true), json!(42), json!(-7), json!(1.5), json!("hi")] {
            assert_eq!(loro_to_json(&json_to_loro(&value)), value);
        }
    }

    #[test]
    fn test_nested_values() {
        let value = json!({"points": [{"x": 1.5, "y": 2.0}], "closed": false});
        assert_eq!(loro_to_json(&json_to_loro(&value)), value);
    }
}
