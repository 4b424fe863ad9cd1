//! Fill/drain behavior across table sizes.

use std::ptr::NonNull;

use rstest::rstest;
use tables::{HashMapMt, HashMapSt, TableError};

fn value() -> NonNull<u64> {
    NonNull::from(Box::leak(Box::new(0u64)))
}

#[rstest]
#[case(16)]
#[case(64)]
#[case(1024)]
fn st_fills_to_capacity_and_rejects_overflow(#[case] capacity: usize) {
    let mut map: HashMapSt<u64, u64> = HashMapSt::new(capacity);
    let v = value();
    for key in 0..capacity as u64 {
        map.insert(key, v).expect("fill");
    }
    assert_eq!(map.len(), capacity);
    assert_eq!(
        map.insert(capacity as u64, v),
        Err(TableError::CapacityExhausted)
    );
    for key in 0..capacity as u64 {
        assert_eq!(map.find(key), Some(v));
    }
}

#[rstest]
#[case(16)]
#[case(64)]
#[case(1024)]
fn mt_fills_to_capacity_and_rejects_overflow(#[case] capacity: usize) {
    let map: HashMapMt<u64> = HashMapMt::new(capacity);
    let v = value();
    for key in 0..capacity as u64 {
        map.insert(key, v).expect("fill");
    }
    assert_eq!(map.len(), capacity);
    assert_eq!(
        map.insert(capacity as u64, v),
        Err(TableError::CapacityExhausted)
    );
    for key in 0..capacity as u64 {
        assert_eq!(map.find(key), Some(v));
    }
}

#[rstest]
#[case(16)]
#[case(256)]
fn st_erase_everything_then_reuse(#[case] capacity: usize) {
    let mut map: HashMapSt<u64, u64> = HashMapSt::new(capacity);
    let v = value();
    for key in 0..capacity as u64 {
        map.insert(key, v).expect("fill");
    }
    for key in 0..capacity as u64 {
        assert!(map.erase(key));
    }
    assert!(map.is_empty());
    for key in 0..capacity as u64 {
        map.insert(key, v).expect("refill");
    }
    assert_eq!(map.len(), capacity);
}
