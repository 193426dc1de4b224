use bloomfilter::Bloom;

use crate::types::PrimaryKey;

/// Probabilistic per-segment primary-key membership filter.
///
/// Used two ways by the ingest pipeline (spec.md §4.3, §4.2): it is
/// populated on every insert so that `FilterNode`/`InsertNode` delete
/// handling can cheaply reject primary keys that provably never landed in
/// this segment, and its capacity is fixed once a segment is sealed
/// (spec.md §5, "Bloom filter capacity is fixed at segment seal time").
pub struct PkBloomFilter {
    inner: Bloom<PrimaryKey>,
}

impl PkBloomFilter {
    /// `expected_items` should be an upper bound on the number of rows the
    /// segment will ever hold; `false_positive_rate` is typically small
    /// (e.g. 0.01) since false positives only cost an extra, ultimately
    /// no-op, delete call rather than correctness.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        PkBloomFilter {
            inner: Bloom::new_for_fp_rate(expected_items, false_positive_rate),
        }
    }

    pub fn insert(&mut self, pk: &PrimaryKey) {
        self.inner.set(pk);
    }

    pub fn insert_all<'a>(&mut self, pks: impl IntoIterator<Item = &'a PrimaryKey>) {
        for pk in pks {
            self.inner.set(pk);
        }
    }

    /// `false` is a hard guarantee of absence; `true` means "maybe present".
    pub fn might_contain(&self, pk: &PrimaryKey) -> bool {
        self.inner.check(pk)
    }

    /// Filters a batch of candidate primary keys down to the ones that
    /// might be present in this segment, used by delete handling to skip
    /// segments that provably never saw the key (spec.md §4.3, §8).
    pub fn filter_candidates(&self, pks: &[PrimaryKey]) -> Vec<PrimaryKey> {
        pks.iter()
            .filter(|pk| self.might_contain(pk))
            .cloned()
            .collect()
    }

    // Merging two segments' filters (e.g. when sealing absorbs a growing
    // segment) is one of the native kernel operations spec.md §1 lists as an
    // external collaborator; this wrapper does not reimplement it.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_every_inserted_key() {
        let mut filter = PkBloomFilter::new(1000, 0.01);
        let keys: Vec<PrimaryKey> = (0..500).map(PrimaryKey::Int64).collect();
        filter.insert_all(&keys);
        for key in &keys {
            assert!(filter.might_contain(key));
        }
    }

    #[test]
    fn absent_key_usually_rejected() {
        let mut filter = PkBloomFilter::new(1000, 0.001);
        filter.insert_all((0..100).map(PrimaryKey::Int64).collect::<Vec<_>>().iter());
        let absent = PrimaryKey::Int64(-1);
        assert!(!filter.might_contain(&absent));
    }

    #[test]
    fn filter_candidates_keeps_only_possible_members() {
        let mut filter = PkBloomFilter::new(100, 0.001);
        filter.insert(&PrimaryKey::Int64(11));
        filter.insert(&PrimaryKey::Int64(22));
        let candidates = vec![
            PrimaryKey::Int64(11),
            PrimaryKey::Int64(999_999),
            PrimaryKey::Int64(22),
        ];
        let kept = filter.filter_candidates(&candidates);
        assert!(kept.contains(&PrimaryKey::Int64(11)));
        assert!(kept.contains(&PrimaryKey::Int64(22)));
        assert!(!kept.contains(&PrimaryKey::Int64(999_999)));
    }
}
