//! Layout rules as seen by callers building interval lists

mod common;

use common::interval_list;
use mosaic_memory::core::size::{GB, KB, MB};
use mosaic_memory::{LayoutViolation, PageSize, validate};
use rstest::rstest;

const L: PageSize = PageSize::HugeLarge;
const M: PageSize = PageSize::HugeMedium;

#[rstest]
#[case::single_large(&[(0, GB, L)])]
#[case::single_medium(&[(2 * MB, 6 * MB, M)])]
#[case::large_then_adjacent_medium(&[(0, 2 * GB, L), (2 * GB, 2 * GB + 2 * MB, M)])]
#[case::medium_below_large(&[(0, 2 * MB, M), (GB, 2 * GB, L)])]
#[case::two_large_one_page_apart(&[(0, GB, L), (2 * GB, 4 * GB, L)])]
#[case::stored_out_of_order(&[(GB, 2 * GB, L), (0, 512 * MB, M)])]
fn test_valid_layouts(#[case] intervals: &[(usize, usize, PageSize)]) {
    assert_eq!(validate(&interval_list(intervals)), Ok(()));
}

#[rstest]
#[case::base_page_window(&[(0, 4 * KB, PageSize::Base)], "INVALID_PAGE_SIZE", 0)]
#[case::large_start_off_page(&[(100, GB + 100, L)], "INVALID_1GB_START_OFFSET", 0)]
#[case::medium_start_off_page(&[(0, GB, L), (GB + 1, GB + 1 + 2 * MB, M)], "INVALID_2MB_START_OFFSET", 1)]
#[case::large_partial_page(&[(0, GB + 2 * MB, L)], "SIZE_OF_1GB_INTERVAL_ERROR", 0)]
#[case::medium_empty(&[(0, 0, M)], "SIZE_OF_2MB_INTERVAL_ERROR", 0)]
#[case::medium_inverted(&[(4 * MB, 2 * MB, M)], "SIZE_OF_2MB_INTERVAL_ERROR", 0)]
#[case::large_overlap(&[(0, 2 * GB, L), (GB, 3 * GB, L)], "OFFSET_BETWEEN_TWO_1GB_INTERVALS_ERROR", 1)]
#[case::large_gap_not_whole_page(&[(0, GB, L), (GB + 2 * MB, 2 * GB + 2 * MB, L)], "OFFSET_BETWEEN_TWO_1GB_INTERVALS_ERROR", 1)]
#[case::medium_overlap(&[(0, 4 * MB, M), (2 * MB, 6 * MB, M)], "OFFSET_BETWEEN_TWO_2MB_INTERVALS_ERROR", 1)]
#[case::medium_gap_not_whole_page(&[(0, 2 * MB, M), (3 * MB, 5 * MB, M)], "OFFSET_BETWEEN_TWO_2MB_INTERVALS_ERROR", 1)]
#[case::mixed_overlap(&[(0, GB, L), (GB - 2 * MB, GB, M)], "OFFSET_BETWEEN_1GB_AND_2MB_INTERVALS_ERROR", 1)]
#[case::mixed_gap_not_whole_page(&[(0, 2 * MB, M), (2 * MB + 4 * KB, GB + 2 * MB + 4 * KB, L)], "OFFSET_BETWEEN_1GB_AND_2MB_INTERVALS_ERROR", 1)]
fn test_invalid_layouts(
    #[case] intervals: &[(usize, usize, PageSize)],
    #[case] code: &str,
    #[case] index: usize,
) {
    let violation = validate(&interval_list(intervals)).unwrap_err();
    assert_eq!(violation.code(), code);
    assert_eq!(violation.index(), index);
    assert!(violation.to_string().starts_with(code));
}

#[test]
fn test_per_interval_rules_win_over_gaps() {
    // The second interval both overlaps the first and has a bad length.
    let list = interval_list(&[(0, GB, L), (GB / 2, GB / 2 + MB, M)]);
    assert_eq!(
        validate(&list),
        Err(LayoutViolation::MediumIntervalSize { index: 1 })
    );
}

#[test]
fn test_validation_leaves_order_untouched() {
    let list = interval_list(&[(GB, 2 * GB, L), (0, 2 * MB, M)]);
    validate(&list).unwrap();
    assert_eq!(list.at(0).unwrap().start_offset, GB);
    assert_eq!(list.at(1).unwrap().start_offset, 0);
}

#[test]
fn test_violation_reported_as_memory_error() {
    let list = interval_list(&[(0, MB, M)]);
    let error: mosaic_memory::MemoryError = validate(&list).unwrap_err().into();
    assert_eq!(error.code(), "MEM:CONFIG:LAYOUT");
}
