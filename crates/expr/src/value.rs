//! Path resolution and dynamically-typed comparison over the serialized
//! object tree.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

/// A dot-separated field path rooted at the object envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path(pub(crate) Vec<String>);

impl Path {
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Walk the serialized object. `None` when any segment is absent or the
    /// intermediate value is not an object.
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut cur = doc;
        for seg in &self.0 {
            cur = cur.get(seg.as_str())?;
        }
        Some(cur)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "$.{}", self.0.join("."))
    }
}

fn as_rfc3339(v: &Value) -> Option<DateTime<FixedOffset>> {
    v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

/// Compare two resolved values by dynamic type: numbers numerically,
/// strings lexically (chronologically when both parse as RFC 3339), bools
/// with false < true. `None` when the types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(_), Value::String(_)) => {
            if let (Some(ta), Some(tb)) = (as_rfc3339(a), as_rfc3339(b)) {
                Some(ta.cmp(&tb))
            } else {
                Some(a.as_str()?.cmp(b.as_str()?))
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_paths() {
        let doc = json!({"ObjectMeta": {"Name": "a"}, "Spec": {"Role": "sender"}});
        let p = Path(vec!["Spec".into(), "Role".into()]);
        assert_eq!(p.resolve(&doc), Some(&json!("sender")));
        let missing = Path(vec!["Spec".into(), "Hostname".into()]);
        assert_eq!(missing.resolve(&doc), None);
    }

    #[test]
    fn compares_by_dynamic_type() {
        assert_eq!(compare_values(&json!(2), &json!(10.0)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("b"), &json!(1)), None);
        assert_eq!(compare_values(&json!(false), &json!(true)), Some(Ordering::Less));
    }

    #[test]
    fn rfc3339_strings_compare_chronologically() {
        // Lexical order would put the +02:00 form after the Z form.
        let earlier = json!("2020-01-01T08:00:00+02:00");
        let later = json!("2020-01-01T07:00:00Z");
        assert_eq!(compare_values(&earlier, &later), Some(Ordering::Less));
    }
}
