//! Sparse numeric containers used by the layer algebra and the query model.
//!
//! Two row representations share one operation surface: an unsorted entry
//! array with O(1) append and erase-by-swap, and a linked variant that
//! tolerates deletion while traversing. A row-major sparse matrix stacks the
//! linked rows. Zero values are never stored; writing a zero erases.

use std::collections::LinkedList;

use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Entries below this magnitude count as zero and are not stored.
const STORAGE_EPSILON: f64 = 1e-12;

fn stored<T: Float>(value: T) -> bool {
    value.abs() > T::from(STORAGE_EPSILON).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub index: usize,
    pub value: T,
}

impl<T> Entry<T> {
    pub fn new(index: usize, value: T) -> Self {
        Self { index, value }
    }
}

/// Unsorted sparse row: a dynamic array of (index, value) entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseRow<T: Float> {
    entries: Vec<Entry<T>>,
    size: usize,
}

impl<T: Float> SparseRow<T> {
    pub fn new(size: usize) -> Self {
        Self {
            entries: Vec::new(),
            size,
        }
    }

    pub fn from_dense(values: &[T]) -> Self {
        let mut row = Self::new(values.len());
        for (index, &value) in values.iter().enumerate() {
            if stored(value) {
                row.entries.push(Entry::new(index, value));
            }
        }
        row
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> T {
        self.entries
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.value)
            .unwrap_or_else(T::zero)
    }

    /// Overwrites the entry at `index`. Writing zero erases by swapping the
    /// last entry into the hole.
    pub fn set(&mut self, index: usize, value: T) {
        let is_zero = !stored(value);
        for i in 0..self.entries.len() {
            if self.entries[i].index == index {
                if is_zero {
                    self.entries.swap_remove(i);
                } else {
                    self.entries[i].value = value;
                }
                return;
            }
        }
        if !is_zero {
            self.entries.push(Entry::new(index, value));
        }
    }

    /// Adds `delta` into the entry at `index`, merging duplicates on insert.
    /// The entry is deleted if the result is zero.
    pub fn add(&mut self, index: usize, delta: T) {
        for i in 0..self.entries.len() {
            if self.entries[i].index == index {
                let merged = self.entries[i].value + delta;
                if stored(merged) {
                    self.entries[i].value = merged;
                } else {
                    self.entries.swap_remove(i);
                }
                return;
            }
        }
        if stored(delta) {
            self.entries.push(Entry::new(index, delta));
        }
    }

    /// Appends without checking for an existing entry. The caller guarantees
    /// `index` is not already present.
    pub fn append(&mut self, index: usize, value: T) {
        if stored(value) {
            self.entries.push(Entry::new(index, value));
        }
    }

    /// Appends an entry in a fresh trailing slot, growing the row.
    pub fn add_last_entry(&mut self, value: T) {
        if stored(value) {
            self.entries.push(Entry::new(self.size, value));
        }
        self.size += 1;
    }

    pub fn increment_size(&mut self) {
        self.size += 1;
    }

    /// Erase by position in the entry array (not by index), swapping the last
    /// entry into the hole.
    pub fn erase_at(&mut self, array_position: usize) {
        self.entries.swap_remove(array_position);
    }

    /// Folds the entry at `source` into the entry at `target`: the values add
    /// up, the source entry disappears, and a zero sum deletes the target too.
    pub fn merge_entries(&mut self, source: usize, target: usize) {
        let mut source_pos = None;
        let mut target_pos = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.index == source {
                source_pos = Some(i);
            } else if e.index == target {
                target_pos = Some(i);
            }
            if source_pos.is_some() && target_pos.is_some() {
                break;
            }
        }

        let Some(source_pos) = source_pos else {
            return;
        };

        match target_pos {
            None => self.entries[source_pos].index = target,
            Some(target_pos) => {
                let sum = self.entries[target_pos].value + self.entries[source_pos].value;
                self.entries[target_pos].value = sum;
                self.entries.swap_remove(source_pos);
                // The swap may have moved the target entry into source_pos.
                if !stored(sum) {
                    let pos = self
                        .entries
                        .iter()
                        .position(|e| e.index == target)
                        .expect("merged entry must still exist");
                    self.entries.swap_remove(pos);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries.iter()
    }

    /// Entries ordered by index; used where a canonical order matters
    /// (equality, serialization).
    pub fn sorted_entries(&self) -> Vec<Entry<T>> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.index);
        entries
    }

    pub fn to_dense(&self, target: &mut [T]) {
        for slot in target.iter_mut() {
            *slot = T::zero();
        }
        for e in &self.entries {
            target[e.index] = e.value;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Float> PartialEq for SparseRow<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.size != other.size || self.entries.len() != other.entries.len() {
            return false;
        }
        let mine = self.sorted_entries();
        let theirs = other.sorted_entries();
        mine.iter()
            .zip(theirs.iter())
            .all(|(a, b)| a.index == b.index && a.value == b.value)
    }
}

/// Linked sparse row. Supports deleting entries while traversing, which the
/// array representation cannot do without invalidating positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseList<T: Float> {
    entries: LinkedList<Entry<T>>,
    size: usize,
}

impl<T: Float> SparseList<T> {
    pub fn new(size: usize) -> Self {
        Self {
            entries: LinkedList::new(),
            size,
        }
    }

    pub fn from_dense(values: &[T]) -> Self {
        let mut list = Self::new(values.len());
        for (index, &value) in values.iter().enumerate() {
            if stored(value) {
                list.entries.push_back(Entry::new(index, value));
            }
        }
        list
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> T {
        self.entries
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.value)
            .unwrap_or_else(T::zero)
    }

    pub fn set(&mut self, index: usize, value: T) {
        if stored(value) {
            for e in self.entries.iter_mut() {
                if e.index == index {
                    e.value = value;
                    return;
                }
            }
            self.entries.push_back(Entry::new(index, value));
        } else {
            self.retain(|e| e.index != index);
        }
    }

    pub fn append(&mut self, index: usize, value: T) {
        if stored(value) {
            self.entries.push_back(Entry::new(index, value));
        }
    }

    pub fn add_last_entry(&mut self, value: T) {
        if stored(value) {
            self.entries.push_back(Entry::new(self.size, value));
        }
        self.size += 1;
    }

    pub fn increment_size(&mut self) {
        self.size += 1;
    }

    /// Keeps only the entries satisfying the predicate; the traversal itself
    /// performs the deletions.
    pub fn retain<F: FnMut(&Entry<T>) -> bool>(&mut self, mut keep: F) {
        let mut kept = LinkedList::new();
        while let Some(entry) = self.entries.pop_front() {
            if keep(&entry) {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
    }

    pub fn merge_entries(&mut self, source: usize, target: usize) {
        let source_value = self.get(source);
        if !stored(source_value) {
            return;
        }
        let had_target = self.entries.iter().any(|e| e.index == target);
        if !had_target {
            for e in self.entries.iter_mut() {
                if e.index == source {
                    e.index = target;
                    return;
                }
            }
        }
        let mut merged = T::zero();
        for e in self.entries.iter() {
            if e.index == source || e.index == target {
                merged = merged + e.value;
            }
        }
        self.retain(|e| e.index != source && e.index != target);
        if stored(merged) {
            self.entries.push_back(Entry::new(target, merged));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries.iter()
    }

    pub fn to_dense(&self, target: &mut [T]) {
        for slot in target.iter_mut() {
            *slot = T::zero();
        }
        for e in &self.entries {
            target[e.index] = e.value;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Row-major sparse matrix: a vector of linked sparse rows, dimensioned m x n.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseMatrix<T: Float> {
    rows: Vec<SparseList<T>>,
    columns: usize,
}

impl<T: Float> SparseMatrix<T> {
    pub fn new(m: usize, n: usize) -> Self {
        Self {
            rows: (0..m).map(|_| SparseList::new(n)).collect(),
            columns: n,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns
    }

    pub fn get(&self, row: usize, column: usize) -> T {
        self.rows[row].get(column)
    }

    pub fn set(&mut self, row: usize, column: usize, value: T) {
        self.rows[row].set(column, value);
    }

    pub fn row(&self, row: usize) -> &SparseList<T> {
        &self.rows[row]
    }

    pub fn add_last_row(&mut self, values: &[T]) {
        debug_assert_eq!(values.len(), self.columns);
        self.rows.push(SparseList::from_dense(values));
    }

    pub fn add_last_column(&mut self, values: &[T]) {
        debug_assert_eq!(values.len(), self.rows.len());
        for (row, &value) in self.rows.iter_mut().zip(values.iter()) {
            row.add_last_entry(value);
        }
        self.columns += 1;
    }

    pub fn add_empty_column(&mut self) {
        for row in self.rows.iter_mut() {
            row.increment_size();
        }
        self.columns += 1;
    }

    pub fn nnz(&self) -> usize {
        self.rows.iter().map(|r| r.nnz()).sum()
    }

    /// Both marginal counts in a single pass over the stored entries.
    pub fn counts_by_row_and_column(&self, row_counts: &mut [usize], column_counts: &mut [usize]) {
        debug_assert_eq!(row_counts.len(), self.rows.len());
        debug_assert_eq!(column_counts.len(), self.columns);
        for c in row_counts.iter_mut() {
            *c = 0;
        }
        for c in column_counts.iter_mut() {
            *c = 0;
        }
        for (i, row) in self.rows.iter().enumerate() {
            for e in row.iter() {
                row_counts[i] += 1;
                column_counts[e.index] += 1;
            }
        }
    }

    pub fn transpose_into(&self, other: &mut SparseMatrix<T>) {
        *other = SparseMatrix::new(self.columns, self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            for e in row.iter() {
                other.rows[e.index].append(i, e.value);
            }
        }
    }

    /// Fills `target` (row-major, m*n slots) with the dense image.
    pub fn to_dense(&self, target: &mut [T]) {
        debug_assert_eq!(target.len(), self.rows.len() * self.columns);
        for slot in target.iter_mut() {
            *slot = T::zero();
        }
        for (i, row) in self.rows.iter().enumerate() {
            for e in row.iter() {
                target[i * self.columns + e.index] = e.value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_set_get_and_zero_erases() {
        let mut row = SparseRow::<f64>::new(6);
        row.set(1, 2.0);
        row.set(4, -3.0);
        assert_eq!(row.nnz(), 2);
        assert_eq!(row.get(1), 2.0);
        assert_eq!(row.get(2), 0.0);

        row.set(1, 0.0);
        assert_eq!(row.nnz(), 1);
        assert_eq!(row.get(1), 0.0);

        // Writing zero into an absent slot stores nothing.
        row.set(0, 0.0);
        assert_eq!(row.nnz(), 1);
    }

    #[test]
    fn row_dense_round_trip() {
        let values = [0.0, 1.5, 0.0, 0.0, -2.0, 0.0];
        let row = SparseRow::from_dense(&values);
        assert_eq!(row.nnz(), 2);

        let mut dense = [9.0; 6];
        row.to_dense(&mut dense);
        assert_eq!(dense, values);
    }

    #[test]
    fn row_merge_entries() {
        let mut row = SparseRow::<f64>::new(5);
        row.set(0, 2.0);
        row.set(3, 5.0);

        // Source and target both present: values add up, source disappears.
        row.merge_entries(0, 3);
        assert_eq!(row.get(3), 7.0);
        assert_eq!(row.get(0), 0.0);
        assert_eq!(row.nnz(), 1);

        // No target: the entry is just renamed.
        row.merge_entries(3, 1);
        assert_eq!(row.get(1), 7.0);

        // Cancellation deletes the target as well.
        row.set(2, -7.0);
        row.merge_entries(2, 1);
        assert!(row.is_empty());
    }

    #[test]
    fn row_add_merges_duplicates() {
        let mut row = SparseRow::<f64>::new(4);
        row.add(2, 1.0);
        row.add(2, 2.5);
        assert_eq!(row.get(2), 3.5);
        assert_eq!(row.nnz(), 1);

        row.add(2, -3.5);
        assert!(row.is_empty());
    }

    #[test]
    fn list_deletion_during_traversal() {
        let mut list = SparseList::from_dense(&[1.0, 0.0, 3.0, -4.0, 5.0]);
        assert_eq!(list.nnz(), 4);

        list.retain(|e| e.value > 0.0);
        assert_eq!(list.nnz(), 3);
        assert_eq!(list.get(3), 0.0);
        assert_eq!(list.get(4), 5.0);
    }

    #[test]
    fn matrix_counts_and_transpose() {
        let mut m = SparseMatrix::<f64>::new(2, 3);
        m.set(0, 0, 1.0);
        m.set(0, 2, 2.0);
        m.set(1, 2, 3.0);
        assert_eq!(m.nnz(), 3);

        let mut rows = [0usize; 2];
        let mut cols = [0usize; 3];
        m.counts_by_row_and_column(&mut rows, &mut cols);
        assert_eq!(rows, [2, 1]);
        assert_eq!(cols, [1, 0, 2]);

        let mut t = SparseMatrix::new(0, 0);
        m.transpose_into(&mut t);
        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.num_columns(), 2);
        assert_eq!(t.get(2, 0), 2.0);
        assert_eq!(t.get(2, 1), 3.0);
        assert_eq!(t.get(1, 0), 0.0);
    }

    #[test]
    fn matrix_grows_by_rows_and_columns() {
        let mut m = SparseMatrix::<f64>::new(1, 2);
        m.set(0, 1, 4.0);

        m.add_last_row(&[5.0, 0.0]);
        m.add_last_column(&[7.0, 0.0]);
        m.add_empty_column();

        assert_eq!(m.num_rows(), 2);
        assert_eq!(m.num_columns(), 4);
        assert_eq!(m.get(0, 2), 7.0);
        assert_eq!(m.get(1, 0), 5.0);

        let mut dense = vec![0.0; 8];
        m.to_dense(&mut dense);
        assert_eq!(dense, vec![0.0, 4.0, 7.0, 0.0, 5.0, 0.0, 0.0, 0.0]);
    }
}
