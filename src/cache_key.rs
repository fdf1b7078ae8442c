/*!
 * Deterministic keys for `(method, params)` pairs
 *
 * The key is `method:` followed by the params array in canonical JSON: object
 * keys sorted, no insignificant whitespace. Two param lists that are equal as
 * JSON values always produce the same key, whatever order their objects were
 * built in.
 */

use serde_json::Value;

/// Derive the cache and coalescing key for a call
pub fn cache_key(method: &str, params: &[Value]) -> String {
    let mut key = String::with_capacity(method.len() + 2 + params.len() * 16);
    key.push_str(method);
    key.push(':');
    key.push('[');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        write_canonical(param, &mut key);
    }
    key.push(']');
    key
}

/// Represent an integer wider than a JSON-safe number in stable text form
///
/// Amounts above 2^53 lose precision in many JSON consumers; passing them as
/// decimal strings keeps both the wire value and the cache key exact.
pub fn large_integer(value: u128) -> Value {
    Value::String(value.to_string())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display for a JSON string value yields the quoted, escaped form
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_object_key_order_does_not_matter() {
        let mut forward = Map::new();
        forward.insert("encoding".into(), json!("base64"));
        forward.insert("commitment".into(), json!("finalized"));

        let mut reverse = Map::new();
        reverse.insert("commitment".into(), json!("finalized"));
        reverse.insert("encoding".into(), json!("base64"));

        assert_eq!(
            cache_key("getAccountInfo", &[json!("abc"), Value::Object(forward)]),
            cache_key("getAccountInfo", &[json!("abc"), Value::Object(reverse)]),
        );
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            cache_key("getBalance", &[json!("abc"), json!({"b": 1, "a": [true, null]})]),
            r#"getBalance:["abc",{"a":[true,null],"b":1}]"#
        );
        assert_eq!(cache_key("getSlot", &[]), "getSlot:[]");
    }

    #[test]
    fn test_method_and_params_distinguish_keys() {
        assert_ne!(cache_key("getSlot", &[]), cache_key("getHealth", &[]));
        assert_ne!(
            cache_key("getBalance", &[json!("a")]),
            cache_key("getBalance", &[json!("b")])
        );
        // A string and a number with the same digits are different params
        assert_ne!(
            cache_key("m", &[json!("1")]),
            cache_key("m", &[json!(1)])
        );
    }

    #[test]
    fn test_escaping_is_stable() {
        assert_eq!(
            cache_key("m", &[json!({"k\"ey": "line\nbreak"})]),
            r#"m:[{"k\"ey":"line\nbreak"}]"#
        );
    }

    #[test]
    fn test_large_integer_is_exact() {
        let lamports: u128 = 340_282_366_920_938_463_463_374_607_431_768_211_455;
        assert_eq!(
            cache_key("transfer", &[large_integer(lamports)]),
            r#"transfer:["340282366920938463463374607431768211455"]"#
        );
    }
}
