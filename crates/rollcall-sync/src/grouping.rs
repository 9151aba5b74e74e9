//! Keeping parent/child rows together across page boundaries.
//!
//! Child rows (audit entries of one contact, say) arrive sorted by parent
//! key, so a parent's rows are contiguous but may straddle two pages. The
//! last group of a page is held back until the next page shows whether it
//! continues; only the final page releases it.

#[derive(Debug, Clone, PartialEq)]
pub struct GroupingBuffer<T> {
    carried: Vec<T>,
}

impl<T> Default for GroupingBuffer<T> {
    fn default() -> Self {
        Self {
            carried: Vec::new(),
        }
    }
}

impl<T> GroupingBuffer<T> {
    /// Resumes with rows deferred by an earlier page.
    pub fn with_carried(carried: Vec<T>) -> Self {
        Self { carried }
    }

    /// Adds a page of rows and returns every group known to be complete, in
    /// order. Unless this is the last page, the trailing group stays in the
    /// buffer.
    pub fn push_page<K, F>(&mut self, rows: Vec<T>, has_more: bool, key: F) -> Vec<Vec<T>>
    where
        K: PartialEq,
        F: Fn(&T) -> K,
    {
        let mut all = std::mem::take(&mut self.carried);
        all.extend(rows);

        let mut groups: Vec<Vec<T>> = Vec::new();
        for row in all {
            match groups.last_mut() {
                Some(group) if group.first().is_some_and(|first| key(first) == key(&row)) => {
                    group.push(row);
                }
                _ => groups.push(vec![row]),
            }
        }

        if has_more {
            if let Some(trailing) = groups.pop() {
                self.carried = trailing;
            }
        }
        groups
    }

    pub fn carried(&self) -> &[T] {
        &self.carried
    }

    pub fn is_empty(&self) -> bool {
        self.carried.is_empty()
    }

    pub fn into_carried(self) -> Vec<T> {
        self.carried
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(row: &(&'static str, u32)) -> &'static str {
        row.0
    }

    #[test]
    fn trailing_group_waits_for_the_next_page() {
        let mut buffer = GroupingBuffer::default();

        let first = buffer.push_page(vec![("a", 1), ("a", 2), ("b", 1)], true, parent);
        assert_eq!(first, vec![vec![("a", 1), ("a", 2)]]);
        assert_eq!(buffer.carried(), &[("b", 1)]);

        let second = buffer.push_page(vec![("b", 2), ("c", 1)], false, parent);
        assert_eq!(second, vec![vec![("b", 1), ("b", 2)], vec![("c", 1)]]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn a_group_can_span_several_pages() {
        let mut buffer = GroupingBuffer::with_carried(vec![("a", 1)]);
        assert!(buffer.push_page(vec![("a", 2)], true, parent).is_empty());
        assert!(buffer.push_page(vec![("a", 3)], true, parent).is_empty());
        let done = buffer.push_page(vec![("b", 1)], false, parent);
        assert_eq!(done, vec![vec![("a", 1), ("a", 2), ("a", 3)], vec![("b", 1)]]);
    }

    #[test]
    fn empty_last_page_flushes_carried_rows() {
        let mut buffer = GroupingBuffer::with_carried(vec![("z", 9)]);
        assert_eq!(buffer.push_page(vec![], false, parent), vec![vec![("z", 9)]]);
    }
}
