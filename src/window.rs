//! Count- and byte-bounded selection over newest-first sequences.
//!
//! Used to decide how much chat history and how many recent tasks fit into a
//! single manager prompt.

/// Budget for a windowed selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOptions {
    /// Items always taken (when available), regardless of bytes.
    pub min_count: usize,
    /// Hard cap on items.
    pub max_count: usize,
    /// Byte ceiling, enforced once `min_count` items are taken.
    pub max_bytes: usize,
}

impl WindowOptions {
    /// Clamp so that `max_count >= min_count`.
    pub fn normalized(self) -> Self {
        Self {
            min_count: self.min_count,
            max_count: self.max_count.max(self.min_count),
            max_bytes: self.max_bytes,
        }
    }
}

/// Select a leading run of `items` (newest first) that fits the window.
///
/// Walks from the front accumulating `estimate_bytes`. Stops at `max_count`
/// items, or before an item that would push the total past `max_bytes` once
/// `min_count` items have been taken. The count floor always wins over the
/// byte ceiling.
pub fn select_by_window<T, F>(items: &[T], options: WindowOptions, estimate_bytes: F) -> &[T]
where
    F: Fn(&T) -> usize,
{
    let options = options.normalized();
    let mut taken = 0usize;
    let mut bytes = 0usize;

    for item in items {
        if taken >= options.max_count {
            break;
        }
        let size = estimate_bytes(item);
        if taken >= options.min_count && bytes.saturating_add(size) > options.max_bytes {
            break;
        }
        bytes = bytes.saturating_add(size);
        taken += 1;
    }

    &items[..taken]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(min_count: usize, max_count: usize, max_bytes: usize) -> WindowOptions {
        WindowOptions {
            min_count,
            max_count,
            max_bytes,
        }
    }

    #[test]
    fn min_count_overrides_byte_ceiling() {
        let items = ["m3", "m2", "m1"];
        let picked = select_by_window(&items, opts(2, 10, 50), |_| 30);
        assert_eq!(picked, &["m3", "m2"]);
    }

    #[test]
    fn byte_ceiling_applies_after_floor() {
        let items = [10usize, 10, 10, 10, 10];
        let picked = select_by_window(&items, opts(1, 10, 25), |n| *n);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn max_count_caps_selection() {
        let items: Vec<u8> = (0..20).collect();
        let picked = select_by_window(&items, opts(0, 5, usize::MAX), |_| 1);
        assert_eq!(picked, &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn max_count_below_min_is_raised() {
        let items = [1, 2, 3, 4];
        let picked = select_by_window(&items, opts(3, 1, 0), |_| 100);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn zero_bytes_with_zero_floor_selects_nothing() {
        let items = ["a", "b"];
        assert!(select_by_window(&items, opts(0, 10, 0), |s| s.len()).is_empty());
    }

    #[test]
    fn fewer_items_than_floor_returns_all() {
        let items = ["only"];
        assert_eq!(select_by_window(&items, opts(5, 10, 1), |_| 1000).len(), 1);
    }

    #[test]
    fn bounds_hold_across_parameter_grid() {
        let items: Vec<usize> = (1..=12).map(|i| i * 7).collect();
        for min_count in 0..6 {
            for max_count in min_count..10 {
                for max_bytes in [0, 10, 50, 200, 10_000] {
                    let picked =
                        select_by_window(&items, opts(min_count, max_count, max_bytes), |n| *n);
                    assert!(picked.len() >= min_count.min(items.len()));
                    assert!(picked.len() <= max_count);
                }
            }
        }
    }
}
