//! Bounded interval list behaviour

mod common;

use common::base_mapper;
use mosaic_memory::core::size::MB;
use mosaic_memory::{IntervalList, MemoryError, PageSize};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn starts(list: &IntervalList) -> Vec<usize> {
    list.iter().map(|interval| interval.start_offset).collect()
}

#[test]
fn test_sort_keeps_ties_in_insertion_order() {
    let mut list = IntervalList::new(base_mapper(), 4).unwrap();
    list.add_interval(4 * MB, 6 * MB, PageSize::HugeMedium).unwrap();
    list.add_interval(0, 2 * MB, PageSize::HugeMedium).unwrap();
    list.add_interval(0, 4 * MB, PageSize::HugeMedium).unwrap();
    list.sort();

    assert_eq!(starts(&list), vec![0, 0, 4 * MB]);
    assert_eq!(list.at(0).unwrap().end_offset, 2 * MB);
    assert_eq!(list.at(1).unwrap().end_offset, 4 * MB);
}

#[test]
fn test_capacity_is_fixed() {
    let mut list = IntervalList::new(base_mapper(), 1).unwrap();
    list.add_interval(0, 2 * MB, PageSize::HugeMedium).unwrap();
    assert!(matches!(
        list.add_interval(2 * MB, 4 * MB, PageSize::HugeMedium),
        Err(MemoryError::CapacityExceeded { capacity: 1, .. })
    ));
    assert_eq!(list.capacity(), 1);
    assert_eq!(list.len(), 1);
}

#[test]
fn test_find_covering_interval() {
    let mut list = IntervalList::new(base_mapper(), 2).unwrap();
    list.add_interval(2 * MB, 4 * MB, PageSize::HugeMedium).unwrap();
    assert!(list.find(MB).is_none());
    assert_eq!(list.find(3 * MB).map(|i| i.start_offset), Some(2 * MB));
    assert!(list.find(4 * MB).is_none());
}

proptest! {
    #[test]
    fn prop_sort_orders_and_is_idempotent(raw in prop::collection::vec((0usize..64, 1usize..8), 1..32)) {
        let mut list = IntervalList::new(base_mapper(), raw.len()).unwrap();
        for &(start, len) in &raw {
            list.add_interval(start * MB, (start + len) * MB, PageSize::HugeMedium).unwrap();
        }

        list.sort();
        let once = list.as_slice().to_vec();
        prop_assert!(once.windows(2).all(|w| w[0].start_offset <= w[1].start_offset));

        list.sort();
        prop_assert_eq!(list.as_slice(), once.as_slice());

        let mut expected: Vec<_> = raw.iter().map(|&(start, _)| start * MB).collect();
        expected.sort_unstable();
        prop_assert_eq!(starts(&list), expected);
    }
}
