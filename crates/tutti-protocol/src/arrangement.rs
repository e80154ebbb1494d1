//! Page arrangement across a session.
//!
//! Every device shows a different page of the same document. The leader picks a
//! shared book page; a device at slot `s` shows `book + s`. A turn moves the book
//! page by the number of devices, so the group walks through the document in
//! consecutive, non-overlapping blocks:
//!
//! ```text
//! slots:      0   1   2
//! book 6:     6   7   8
//! Next →  9:  9  10  11
//! ```

use crate::message::{BookPage, Direction};

const fn clamp_u32(n: usize) -> u32 {
    if n > u32::MAX as usize {
        u32::MAX
    } else {
        n as u32
    }
}

/// Page shown by the device at `slot`.
///
/// ```
/// use tutti_protocol::arrangement::local_page;
///
/// assert_eq!(local_page(9, 0), 9);
/// assert_eq!(local_page(9, 2), 11);
/// ```
pub const fn local_page(book_page: BookPage, slot: usize) -> u32 {
    book_page.saturating_add(clamp_u32(slot))
}

/// How far one turn moves the book page. Never zero.
pub const fn stride(roster_size: usize) -> u32 {
    if roster_size == 0 {
        1
    } else {
        clamp_u32(roster_size)
    }
}

/// Unbounded turn. `Previous` clamps at page 0.
pub const fn advance(book_page: BookPage, direction: Direction, roster_size: usize) -> BookPage {
    match direction {
        Direction::Next => book_page.saturating_add(stride(roster_size)),
        Direction::Previous => book_page.saturating_sub(stride(roster_size)),
    }
}

/// Turn bounded by the document length.
///
/// `Next` yields `None` when the new arrangement would put the last slot past the
/// final page. `Previous` is never rejected. An unknown `page_count` rejects nothing.
pub const fn try_advance(
    book_page: BookPage,
    direction: Direction,
    roster_size: usize,
    page_count: Option<u32>,
) -> Option<BookPage> {
    match direction {
        Direction::Previous => Some(advance(book_page, direction, roster_size)),
        Direction::Next => {
            let step = stride(roster_size);
            let next = match book_page.checked_add(step) {
                Some(next) => next,
                None => return None,
            };
            match page_count {
                Some(count) if next as u64 + step as u64 > count as u64 => None,
                _ => Some(next),
            }
        }
    }
}

/// Book page that makes the device at `slot` show `local_page`.
pub const fn book_page_for(local_page: u32, slot: usize) -> BookPage {
    local_page.saturating_sub(clamp_u32(slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn three_devices_turn_from_six_to_nine() {
        let book = advance(6, Direction::Next, 3);
        assert_eq!(book, 9);
        let pages: Vec<u32> = (0..3).map(|slot| local_page(book, slot)).collect();
        assert_eq!(pages, vec![9, 10, 11]);
    }

    #[test]
    fn empty_roster_still_moves() {
        assert_eq!(stride(0), 1);
        assert_eq!(advance(4, Direction::Next, 0), 5);
        assert_eq!(advance(4, Direction::Previous, 0), 3);
    }

    #[test]
    fn previous_clamps_at_zero() {
        assert_eq!(advance(2, Direction::Previous, 3), 0);
        assert_eq!(advance(0, Direction::Previous, 1), 0);
        assert_eq!(try_advance(1, Direction::Previous, 4, Some(10)), Some(0));
    }

    #[test]
    fn next_rejected_past_last_page() {
        // 12 pages, 3 devices: book 6 shows 6..=8, book 9 shows 9..=11.
        assert_eq!(try_advance(6, Direction::Next, 3, Some(12)), Some(9));
        assert_eq!(try_advance(9, Direction::Next, 3, Some(12)), None);
        // 11 pages: the third device would land on page 11, which doesn't exist.
        assert_eq!(try_advance(6, Direction::Next, 3, Some(11)), None);
    }

    #[test]
    fn unknown_page_count_never_rejects() {
        assert_eq!(try_advance(900, Direction::Next, 2, None), Some(902));
    }

    #[test]
    fn overflow_is_rejected_not_wrapped() {
        assert_eq!(try_advance(u32::MAX, Direction::Next, 1, None), None);
        assert_eq!(advance(u32::MAX, Direction::Next, 3), u32::MAX);
    }

    #[test]
    fn go_to_page_for_leader_is_identity() {
        assert_eq!(book_page_for(17, 0), 17);
        assert_eq!(book_page_for(1, 3), 0);
    }

    proptest! {
        #[test]
        fn slot_offset_inverts(book in 0u32..1_000_000, slot in 0usize..16) {
            prop_assert_eq!(book_page_for(local_page(book, slot), slot), book);
        }

        #[test]
        fn next_then_previous_returns(book in 0u32..1_000_000, n in 0usize..16) {
            let forward = advance(book, Direction::Next, n);
            prop_assert_eq!(advance(forward, Direction::Previous, n), book);
        }

        #[test]
        fn bounded_next_keeps_every_slot_in_document(
            book in 0u32..1_000,
            n in 1usize..8,
            count in 0u32..1_200,
        ) {
            if let Some(next) = try_advance(book, Direction::Next, n, Some(count)) {
                prop_assert!(local_page(next, n - 1) < count);
            }
        }

        #[test]
        fn blocks_do_not_overlap(book in 0u32..1_000_000, n in 1usize..16) {
            let next = advance(book, Direction::Next, n);
            prop_assert!(local_page(book, n - 1) < local_page(next, 0));
        }
    }
}
