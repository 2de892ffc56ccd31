const WORD_BITS: u64 = 64;

/// Growable bitset over blob ids, one bit per id, backed by 64-bit words.
///
/// No upper bound is declared up front; the word array grows to the highest
/// id observed. All set-arithmetic the orphan scan needs lives here so no
/// external numeric crate is involved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobBitmap {
    words: Vec<u64>,
}

impl BlobBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bit for `id`, growing storage as needed. Returns `true` when
    /// the bit was not already set.
    pub fn set(&mut self, id: u64) -> bool {
        let word_index = (id / WORD_BITS) as usize;
        let mask = 1u64 << (id % WORD_BITS);
        if word_index >= self.words.len() {
            self.words.resize(word_index + 1, 0);
        }
        let word = &mut self.words[word_index];
        let newly_set = *word & mask == 0;
        *word |= mask;
        newly_set
    }

    pub fn contains(&self, id: u64) -> bool {
        let word_index = (id / WORD_BITS) as usize;
        match self.words.get(word_index) {
            Some(word) => word & (1u64 << (id % WORD_BITS)) != 0,
            None => false,
        }
    }

    /// Bits set in `self` but not in `other`.
    pub fn and_not(&self, other: &Self) -> Self {
        let words = self
            .words
            .iter()
            .enumerate()
            .map(|(index, word)| word & !other.words.get(index).copied().unwrap_or(0))
            .collect();
        Self { words }
    }

    /// Lowest set bit at or above `start`, if any.
    pub fn next_set_bit_from(&self, start: u64) -> Option<u64> {
        let mut word_index = (start / WORD_BITS) as usize;
        if word_index >= self.words.len() {
            return None;
        }
        let mut word = self.words[word_index] & (!0u64 << (start % WORD_BITS));
        loop {
            if word != 0 {
                return Some(word_index as u64 * WORD_BITS + u64::from(word.trailing_zeros()));
            }
            word_index += 1;
            if word_index >= self.words.len() {
                return None;
            }
            word = self.words[word_index];
        }
    }

    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|word| u64::from(word.count_ones()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Lazy low-to-high walk of set bits. Single pass; build a fresh iterator
    /// to walk again.
    pub fn iter_set_bits(&self) -> SetBits<'_> {
        SetBits {
            bitmap: self,
            next: 0,
        }
    }
}

pub struct SetBits<'a> {
    bitmap: &'a BlobBitmap,
    next: u64,
}

impl Iterator for SetBits<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let bit = self.bitmap.next_set_bit_from(self.next)?;
        self.next = bit + 1;
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_newly_set() {
        let mut bitmap = BlobBitmap::new();
        assert!(bitmap.set(5));
        assert!(!bitmap.set(5));
        assert!(bitmap.contains(5));
        assert!(!bitmap.contains(4));
    }

    #[test]
    fn grows_to_the_highest_observed_id() {
        let mut bitmap = BlobBitmap::new();
        bitmap.set(0);
        bitmap.set(1000);
        assert!(bitmap.contains(0));
        assert!(bitmap.contains(1000));
        assert!(!bitmap.contains(999));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn and_not_computes_orphan_set() {
        let mut tracked = BlobBitmap::new();
        for id in [1, 3, 5] {
            tracked.set(id);
        }
        let mut actual = BlobBitmap::new();
        for id in [1, 2, 3, 4] {
            actual.set(id);
        }
        let orphans = actual.and_not(&tracked);
        assert_eq!(orphans.iter_set_bits().collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn and_not_handles_mismatched_lengths() {
        let mut actual = BlobBitmap::new();
        actual.set(200);
        let mut tracked = BlobBitmap::new();
        tracked.set(1);
        let orphans = actual.and_not(&tracked);
        assert_eq!(orphans.iter_set_bits().collect::<Vec<_>>(), vec![200]);

        // Tracked ids beyond the actual range contribute nothing.
        let none = tracked.and_not(&actual);
        assert_eq!(none.iter_set_bits().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn next_set_bit_walks_across_word_boundaries() {
        let mut bitmap = BlobBitmap::new();
        for id in [0, 63, 64, 130] {
            bitmap.set(id);
        }
        assert_eq!(bitmap.next_set_bit_from(0), Some(0));
        assert_eq!(bitmap.next_set_bit_from(1), Some(63));
        assert_eq!(bitmap.next_set_bit_from(64), Some(64));
        assert_eq!(bitmap.next_set_bit_from(65), Some(130));
        assert_eq!(bitmap.next_set_bit_from(131), None);
        assert_eq!(bitmap.next_set_bit_from(10_000), None);
    }

    #[test]
    fn iterator_yields_ascending_ids() {
        let mut bitmap = BlobBitmap::new();
        for id in [700, 2, 64, 2, 65] {
            bitmap.set(id);
        }
        assert_eq!(
            bitmap.iter_set_bits().collect::<Vec<_>>(),
            vec![2, 64, 65, 700]
        );
    }

    #[test]
    fn empty_bitmap_has_no_bits() {
        let bitmap = BlobBitmap::new();
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.next_set_bit_from(0), None);
        assert_eq!(bitmap.iter_set_bits().count(), 0);
    }
}
