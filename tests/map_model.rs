//! Model-based test: a map driven by an arbitrary operation sequence must
//! behave exactly like `std::collections::BTreeMap`, including rank lookups
//! and the negated-insertion-point protocol.

use std::collections::BTreeMap;

use proptest::prelude::*;
use thicketdb::{Store, Value};

#[derive(Debug, Clone)]
enum Op {
    Put(i16, i32),
    Remove(i16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<i16>(), any::<i32>()).prop_map(|(k, v)| Op::Put(k, v)),
        any::<i16>().prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn map_matches_btreemap(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let store = Store::builder().page_split_size(256).open().unwrap();
        let map = store.open_map("model").unwrap();
        let mut reference: BTreeMap<i64, i64> = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Put(k, v) => {
                    let old = map.put(k as i64, v as i64).unwrap();
                    let expected = reference.insert(k as i64, v as i64);
                    prop_assert_eq!(old, expected.map(Value::from));
                }
                Op::Remove(k) => {
                    let old = map.remove(k as i64).unwrap();
                    let expected = reference.remove(&(k as i64));
                    prop_assert_eq!(old, expected.map(Value::from));
                }
            }
        }

        prop_assert_eq!(map.len(), reference.len() as u64);

        // point reads
        for (&k, &v) in &reference {
            prop_assert_eq!(map.get(k).unwrap(), Some(Value::from(v)));
        }

        // rank <-> key consistency for present keys
        for (rank, &k) in reference.keys().enumerate() {
            prop_assert_eq!(map.get_key_index(k).unwrap(), rank as i64);
            prop_assert_eq!(map.get_key(rank as i64).unwrap(), Some(Value::from(k)));
        }

        // negated insertion points for absent probes
        for probe in [-40000i64, -1, 0, 1, 1000, 40000] {
            if !reference.contains_key(&probe) {
                let index = map.get_key_index(probe).unwrap();
                prop_assert!(index < 0);
                let insertion = reference.range(..probe).count() as i64;
                prop_assert_eq!(-index - 1, insertion);
            }
        }

        // ordered iteration
        let mut cursor = map.key_iterator(None).unwrap();
        let mut seen = Vec::new();
        while let Some(k) = cursor.next().unwrap() {
            seen.push(k.as_long().unwrap());
        }
        let expected: Vec<i64> = reference.keys().copied().collect();
        prop_assert_eq!(seen, expected);
    }
}
