//! Decoded records and the keys used to group and order them.

use std::cmp::Ordering;

use serde_json::Value;

use super::Row;

/// One decoded record. Immutable once read.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Position in decode order within the unit; the tie-breaker for equal order keys.
    pub position: usize,
    /// The record's fields, published verbatim (after encryption).
    pub fields: Row,
}

impl Record {
    /// Wrap decoded fields.
    pub fn new(position: usize, fields: Row) -> Self {
        Self { position, fields }
    }

    /// The record's group key: `field` rendered as text, else `hint`.
    ///
    /// Strings are used as-is; numbers and booleans use their JSON text.
    /// Null, empty strings, arrays, and objects do not count as a key.
    pub fn group_key(&self, field: &str, hint: Option<&str>) -> Option<String> {
        let own = match self.fields.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        };
        own.or_else(|| hint.map(str::to_owned))
    }

    /// The record's order key, or `None` if `field` is absent or unusable.
    pub fn order_key(&self, field: &str) -> Option<OrderKey> {
        self.fields.get(field).and_then(OrderKey::from_value)
    }
}

/// Sort key establishing emission order within a group.
///
/// Numbers (and strings that parse as numbers, as every table column arrives
/// as text) compare numerically. Integers are kept exact so nanosecond epoch
/// timestamps beyond 2^53 stay distinct; an integer and a float compare by
/// exact value. Other strings, such as RFC 3339 timestamps, compare lexically.
/// Every number sorts before every text key.
#[derive(Debug, Clone)]
pub enum OrderKey {
    /// An integral key, held exactly.
    Int(i128),
    /// A finite non-integral (or out of integer range) numeric key.
    Float(f64),
    /// A textual key.
    Text(String),
}

impl OrderKey {
    /// Build a key from a JSON value; null, booleans, arrays, objects, and
    /// non-finite numbers have no key.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(OrderKey::Int(i128::from(i)))
                } else if let Some(u) = n.as_u64() {
                    Some(OrderKey::Int(i128::from(u)))
                } else {
                    n.as_f64().filter(|f| f.is_finite()).map(OrderKey::Float)
                }
            }
            Value::String(s) => Some(Self::parse_text(s)),
            _ => None,
        }
    }

    fn parse_text(s: &str) -> Self {
        let trimmed = s.trim();
        if let Ok(i) = trimmed.parse::<i128>() {
            return OrderKey::Int(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => OrderKey::Float(f),
            _ => OrderKey::Text(s.to_owned()),
        }
    }
}

/// Exact comparison of an integer with a finite float.
fn cmp_int_float(i: i128, f: f64) -> Ordering {
    // 2^127: the first float magnitude outside i128.
    const BOUND: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;
    let whole = f.trunc();
    if whole >= BOUND {
        return Ordering::Less;
    }
    if whole < -BOUND {
        return Ordering::Greater;
    }
    match i.cmp(&(whole as i128)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use OrderKey::{Float, Int, Text};
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Text(a), Text(b)) => a.cmp(b),
            (Text(_), _) => Ordering::Greater,
            (_, Text(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(map) => Record::new(0, map),
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn group_key_prefers_own_field() {
        let r = record(json!({"customer_id": "A"}));
        assert_eq!(r.group_key("customer_id", Some("hint")), Some("A".into()));
    }

    #[test]
    fn group_key_renders_numbers() {
        let r = record(json!({"customer_id": 42}));
        assert_eq!(r.group_key("customer_id", None), Some("42".into()));
    }

    #[test]
    fn group_key_falls_back_to_hint() {
        let r = record(json!({"other": "x"}));
        assert_eq!(r.group_key("customer_id", Some("cust-9")), Some("cust-9".into()));
        let empty = record(json!({"customer_id": ""}));
        assert_eq!(empty.group_key("customer_id", Some("cust-9")), Some("cust-9".into()));
    }

    #[test]
    fn group_key_absent_without_hint() {
        let r = record(json!({"customer_id": null}));
        assert_eq!(r.group_key("customer_id", None), None);
    }

    #[test]
    fn numeric_keys_compare_numerically() {
        let two = OrderKey::from_value(&json!(2)).unwrap();
        let ten = OrderKey::from_value(&json!("10")).unwrap();
        assert!(two < ten);
    }

    #[test]
    fn timestamps_compare_lexically() {
        let a = OrderKey::from_value(&json!("2024-05-01T09:00:00Z")).unwrap();
        let b = OrderKey::from_value(&json!("2024-05-01T10:00:00Z")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn numbers_sort_before_text() {
        let n = OrderKey::from_value(&json!(1e12)).unwrap();
        let t = OrderKey::from_value(&json!("a")).unwrap();
        assert!(n < t);
    }

    #[test]
    fn integer_and_float_forms_are_equal() {
        assert_eq!(
            OrderKey::from_value(&json!(1)).unwrap(),
            OrderKey::from_value(&json!("1.0")).unwrap()
        );
    }

    #[test]
    fn nanosecond_timestamps_stay_distinct() {
        let earlier = OrderKey::from_value(&json!(1_714_557_600_123_456_788_i64)).unwrap();
        let later = OrderKey::from_value(&json!("1714557600123456789")).unwrap();
        assert!(earlier < later);
        assert_ne!(earlier, later);
    }

    #[test]
    fn integers_and_floats_compare_by_exact_value() {
        let key = |v: Value| OrderKey::from_value(&v).unwrap();
        assert!(key(json!(2)) < key(json!(2.5)));
        assert!(key(json!(3)) > key(json!(2.5)));
        assert!(key(json!(-3)) < key(json!(-2.5)));
        assert!(key(json!(-2)) > key(json!(-2.5)));
        assert!(key(json!(u64::MAX)) < key(json!(1e30)));
        assert!(key(json!("1e40")) > key(json!(i64::MAX)));
    }

    #[test]
    fn unusable_values_have_no_key() {
        for v in [json!(null), json!(true), json!([1]), json!({"t": 1})] {
            assert!(OrderKey::from_value(&v).is_none(), "{v}");
        }
        assert!(record(json!({})).order_key("timestamp").is_none());
    }
}
