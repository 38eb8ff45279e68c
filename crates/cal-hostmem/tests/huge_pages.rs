//! Huge-page allocation against the live system
//!
//! Most CI hosts have no hugetlbfs mount; these tests only exercise the mapping path
//! when one is present and otherwise check that the absence is reported cleanly.

use cal_hostmem::{has_huge_pages, huge_page_size, HostMemError, HugePages};
use serial_test::serial;

#[test]
#[serial]
fn allocate_reports_unavailability_or_maps() {
    let len = huge_page_size().max(4096);
    match HugePages::allocate(len) {
        Ok(mut pages) => {
            assert!(has_huge_pages());
            assert_eq!(pages.len(), len);
            pages.as_mut_slice()[0] = 0xAB;
            pages.as_mut_slice()[len - 1] = 0xCD;
            assert_eq!(pages.as_slice()[0], 0xAB);
        }
        Err(HostMemError::HugePagesUnavailable(_)) => assert!(!has_huge_pages()),
        // A mount may exist without any reserved pages
        Err(HostMemError::Io { .. }) | Err(HostMemError::Allocation { .. }) => {}
    }
}

#[test]
#[serial]
fn resize_preserves_contents_when_available() {
    if !has_huge_pages() {
        return;
    }
    let page = huge_page_size();
    let Ok(mut pages) = HugePages::allocate(page) else {
        return;
    };
    pages.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);

    let Ok(grown) = pages.resize(2 * page) else {
        return;
    };
    assert_eq!(&grown.as_slice()[..4], &[1, 2, 3, 4]);
}

#[test]
#[serial]
fn unaligned_request_maps_whole_pages() {
    if !has_huge_pages() {
        return;
    }
    let page = huge_page_size();
    let Ok(mut pages) = HugePages::allocate(page + 17) else {
        return;
    };
    assert_eq!(pages.len(), page + 17);
    assert_eq!(pages.mapped_len(), 2 * page);
    pages.as_mut_slice()[page + 16] = 0x5A;
    assert_eq!(pages.as_slice()[page + 16], 0x5A);
    // Drop unmaps the rounded length
}
