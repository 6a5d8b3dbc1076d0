extern crate jsv4;

use std::collections::BTreeSet;

use proptest::prelude::*;

use jsv4::runner::ds::identifier::IdentifierTable;
use jsv4::runner::ds::internal_class::InternalClassPool;
use jsv4::runner::ds::managed::{VTable, MANAGED_VTABLE};
use jsv4::runner::ds::property::PropertyAttributes;
use jsv4::runner::ds::sparse_array::SparseArray;
use jsv4::runner::ds::value::{double_to_int32, Value, ValueTag, TAG_SHIFT};

/// ToInt32 by way of wide integer arithmetic.
fn reference_to_int32(d: f64) -> i32 {
    if !d.is_finite() {
        return 0;
    }
    (d.trunc() as i64 as u32) as i32
}

#[test]
fn test_to_int32_edge_cases() {
    assert_eq!(double_to_int32(f64::NAN), 0);
    assert_eq!(double_to_int32(f64::INFINITY), 0);
    assert_eq!(double_to_int32(f64::NEG_INFINITY), 0);
    assert_eq!(double_to_int32(-0.0), 0);
    assert_eq!(double_to_int32(4294967297.5), 1);
    assert_eq!(double_to_int32(2147483648.0), i32::MIN);
    assert_eq!(double_to_int32(-2147483649.0), i32::MAX);
    assert_eq!(double_to_int32(-1.9), -1);
}

proptest! {
    #[test]
    fn prop_finite_doubles_round_trip(d in any::<f64>().prop_filter("finite", |d| d.is_finite())) {
        let v = Value::from_double(d);
        prop_assert!(v.is_double());
        prop_assert_eq!(v.double_value().to_bits(), d.to_bits());
    }

    #[test]
    fn prop_tagged_words_are_not_doubles(tag in 0u32..6, payload in any::<u32>()) {
        prop_assert!(ValueTag::from_u32(tag).is_some());
        let v = Value::from_raw(((tag as u64) << TAG_SHIFT) | payload as u64);
        prop_assert!(!v.is_double());
        prop_assert_eq!(v.tag(), ValueTag::from_u32(tag));
    }

    #[test]
    fn prop_to_int32_matches_reference(d in -1.0e18f64..1.0e18) {
        prop_assert_eq!(double_to_int32(d), reference_to_int32(d));
    }

    #[test]
    fn prop_int32_values_stay_integers(i in any::<i32>()) {
        let v = Value::from_int32(i);
        prop_assert!(v.is_integer());
        prop_assert_eq!(v.int_32(), i);
        prop_assert_eq!(v.as_number(), Some(i as f64));
    }

    #[test]
    fn prop_transitions_are_memoized(picks in prop::collection::vec(0usize..8, 0..12)) {
        let mut ids = IdentifierTable::new();
        let names: Vec<_> = picks.iter().map(|n| ids.intern(&format!("p{}", n))).collect();
        let mut pool = InternalClassPool::new(VTable::Managed(&MANAGED_VTABLE));
        let start = pool.empty_class();
        let walk = |pool: &mut InternalClassPool| {
            let mut c = start;
            for &id in &names {
                c = pool.add_member(c, id, PropertyAttributes::data()).0;
            }
            c
        };
        let first = walk(&mut pool);
        let classes = pool.len();
        let second = walk(&mut pool);
        prop_assert_eq!(first, second);
        prop_assert_eq!(pool.len(), classes);
        let distinct: BTreeSet<_> = picks.iter().collect();
        prop_assert_eq!(pool.get(first).size() as usize, distinct.len());
    }

    #[test]
    fn prop_sparse_array_keys_track_a_set(ops in prop::collection::vec((any::<bool>(), 0u32..200), 1..150)) {
        let mut array = SparseArray::new();
        let mut model = BTreeSet::new();
        for (insert, key) in ops {
            if insert {
                array.insert(key);
                model.insert(key);
            } else if let Some(n) = array.find_node(key) {
                array.erase(n);
                model.remove(&key);
            } else {
                prop_assert!(!model.contains(&key));
            }
            prop_assert!(array.validate().is_ok());
        }
        for k in 0..200 {
            prop_assert_eq!(array.find_node(k).is_some(), model.contains(&k));
        }
        let keys = array.keys();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(keys, model.into_iter().collect::<Vec<_>>());
    }
}
