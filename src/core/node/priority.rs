//! Node priorities.
//!
//! A priority is a hidden ordering attribute: absent, a number, or a string.
//! Absent sorts first, numbers next (numerically), strings last
//! (lexicographically).

use std::cmp::Ordering;

use ordered_float::OrderedFloat;
use serde_json::Value;

use crate::error::{invalid_argument, DatabaseResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    #[default]
    None,
    Number(OrderedFloat<f64>),
    String(String),
}

impl Priority {
    pub fn from_json(value: &Value) -> DatabaseResult<Self> {
        match value {
            Value::Null => Ok(Priority::None),
            Value::Number(number) => {
                let number = number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Priority number is out of range"))?;
                Ok(Priority::Number(OrderedFloat(number)))
            }
            Value::String(text) => Ok(Priority::String(text.clone())),
            _ => Err(invalid_argument(
                "Priority must be a string, number, or null",
            )),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Priority::None)
    }

    pub fn to_json(&self) -> Value {
        match self {
            Priority::None => Value::Null,
            Priority::Number(number) => serde_json::json!(number.into_inner()),
            Priority::String(text) => Value::String(text.clone()),
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        use Priority::*;
        match (self, other) {
            (None, None) => Ordering::Equal,
            (None, _) => Ordering::Less,
            (_, None) => Ordering::Greater,
            (Number(a), Number(b)) => a.cmp(b),
            (Number(_), String(_)) => Ordering::Less,
            (String(_), Number(_)) => Ordering::Greater,
            (String(a), String(b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn none_sorts_before_numbers_before_strings() {
        let mut priorities = vec![
            Priority::String("b".into()),
            Priority::Number(OrderedFloat(2.0)),
            Priority::None,
            Priority::String("a".into()),
            Priority::Number(OrderedFloat(-1.0)),
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                Priority::None,
                Priority::Number(OrderedFloat(-1.0)),
                Priority::Number(OrderedFloat(2.0)),
                Priority::String("a".into()),
                Priority::String("b".into()),
            ]
        );
    }

    #[test]
    fn json_round_trip() {
        for value in [json!(null), json!(4.5), json!("high")] {
            let priority = Priority::from_json(&value).unwrap();
            assert_eq!(priority.to_json(), value);
        }
        assert!(Priority::from_json(&json!({ "bad": true })).is_err());
        assert!(Priority::from_json(&json!([1])).is_err());
    }
}
