//! Sorted set difference between two directory listings.

/// Members only present in the old listing (`deleted`) or only in the new one
/// (`added`), both in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    pub added: Vec<T>,
    pub deleted: Vec<T>,
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

/// Single merge pass over two ascending slices.
///
/// Both inputs must already be sorted; the result is unspecified otherwise.
pub fn diff<T: Ord + Clone>(old: &[T], new: &[T]) -> Diff<T> {
    let mut added = Vec::new();
    let mut deleted = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                deleted.push(old[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(new[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    deleted.extend_from_slice(&old[i..]);
    added.extend_from_slice(&new[j..]);

    Diff { added, deleted }
}
