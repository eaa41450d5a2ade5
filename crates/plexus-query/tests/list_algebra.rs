use std::collections::HashSet;

use plexus_query::BusList;
use plexus_records::{FilterSpec, QueryParams, Record};
use proptest::prelude::*;
use serde_json::json;

fn arb_list() -> impl Strategy<Value = BusList> {
    prop::collection::vec((0u8..12, 0i64..6, prop::bool::ANY), 0..16).prop_map(|rows| {
        let items = rows
            .into_iter()
            .map(|(id, priority, anonymous)| {
                let mut raw = json!({"kind": "event", "priority": priority, "type": "tick"});
                if anonymous {
                    raw["content"] = json!(id);
                } else {
                    raw["event_id"] = json!(format!("e{id}"));
                }
                Record::from_raw(raw).expect("generated record parses")
            })
            .collect();
        BusList::from_get("events", QueryParams::default(), items)
    })
}

fn keys(list: &BusList) -> Vec<String> {
    list.keys()
}

proptest! {
    #[test]
    fn filter_is_idempotent(list in arb_list(), min in 0i64..6) {
        let filter = FilterSpec::new().priority_min(min).compile().expect("compiles");
        let once = list.filter(&filter);
        let twice = once.filter(&filter);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_has_unique_keys_and_commutes_as_a_set(a in arb_list(), b in arb_list()) {
        let ab = &a + &b;
        let ba = &b + &a;
        let ab_keys = keys(&ab);
        let unique: HashSet<_> = ab_keys.iter().cloned().collect();
        prop_assert_eq!(unique.len(), ab_keys.len());
        prop_assert_eq!(ab.key_set(), ba.key_set());
        prop_assert_eq!(ab.key_set(), a.key_set().union(&b.key_set()).cloned().collect::<HashSet<_>>());
    }

    #[test]
    fn intersect_is_a_subset_of_both(a in arb_list(), b in arb_list()) {
        let both = &a & &b;
        prop_assert!(both.key_set().is_subset(&a.key_set()));
        prop_assert!(both.key_set().is_subset(&b.key_set()));
    }

    #[test]
    fn difference_is_disjoint_from_right(a in arb_list(), b in arb_list()) {
        let only_left = &a - &b;
        prop_assert!(only_left.key_set().is_disjoint(&b.key_set()));
        prop_assert!(only_left.key_set().is_subset(&a.key_set()));
    }
}
