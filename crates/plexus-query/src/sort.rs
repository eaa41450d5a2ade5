use std::cmp::Ordering;

use plexus_records::Record;
use serde_json::Value;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

fn compare_present(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match type_rank(a).cmp(&type_rank(b)) {
            Ordering::Equal => a.to_string().cmp(&b.to_string()),
            other => other,
        },
    }
}

/// Orders two optional field values. Missing values sort last in both
/// directions; numbers compare numerically and come before strings.
pub fn compare_fields(a: Option<&Value>, b: Option<&Value>, reverse: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ord = compare_present(x, y);
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

/// Stable multi-key sort.
pub(crate) fn sort_records(items: Vec<Record>, by: &[String], reverse: bool) -> Vec<Record> {
    let mut keyed: Vec<(Vec<Option<Value>>, Record)> = items
        .into_iter()
        .map(|record| (by.iter().map(|f| record.field(f)).collect(), record))
        .collect();
    keyed.sort_by(|(ka, _), (kb, _)| {
        ka.iter()
            .zip(kb.iter())
            .map(|(a, b)| compare_fields(a.as_ref(), b.as_ref(), reverse))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    keyed.into_iter().map(|(_, record)| record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: &str, extra: Value) -> Record {
        let mut raw = json!({"kind": "message", "message_id": id});
        if let (Some(obj), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        Record::from_raw(raw).expect("parses")
    }

    fn ids(items: &[Record]) -> Vec<&str> {
        items.iter().filter_map(Record::identity).collect()
    }

    #[test]
    fn missing_values_sort_last_even_when_reversed() {
        let items = vec![
            rec("a", json!({"timestamp": 2.0})),
            rec("b", json!({})),
            rec("c", json!({"timestamp": 10.0})),
        ];
        let asc = sort_records(items.clone(), &["timestamp".into()], false);
        assert_eq!(ids(&asc), vec!["a", "c", "b"]);
        let desc = sort_records(items, &["timestamp".into()], true);
        assert_eq!(ids(&desc), vec!["c", "a", "b"]);
    }

    #[test]
    fn numbers_compare_numerically_and_before_strings() {
        let items = vec![
            rec("a", json!({"metadata": {"rank": "10"}})),
            rec("b", json!({"metadata": {"rank": 9}})),
            rec("c", json!({"metadata": {"rank": 10}})),
            rec("d", json!({"metadata": {"rank": "9"}})),
        ];
        let sorted = sort_records(items, &["metadata.rank".into()], false);
        assert_eq!(ids(&sorted), vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn secondary_keys_break_ties_and_sort_is_stable() {
        let items = vec![
            rec("a", json!({"priority": 1, "type": "y"})),
            rec("b", json!({"priority": 2, "type": "x"})),
            rec("c", json!({"priority": 1, "type": "x"})),
            rec("d", json!({"priority": 1, "type": "x"})),
        ];
        let sorted = sort_records(items, &["priority".into(), "type".into()], false);
        assert_eq!(ids(&sorted), vec!["c", "d", "a", "b"]);
    }
}
