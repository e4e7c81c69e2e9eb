use bincode::{Decode, Encode};
use std::collections::BTreeSet;
use std::fmt;

/// Default number of coverage points tracked by a map.
pub const DEFAULT_MAP_SIZE: usize = 4096;

const fn bucket_of(count: u8) -> u8 {
    if count == 0 {
        0
    } else {
        1 << (7 - count.leading_zeros())
    }
}

const fn build_bucket_lookup() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = bucket_of(i as u8);
        i += 1;
    }
    table
}

/// Highest set bit of every possible raw hit count.
static BUCKET_LOOKUP: [u8; 256] = build_bucket_lookup();

/// Rounds a raw hit count down to the nearest power of two (0 stays 0).
#[inline]
pub fn bucket(count: u8) -> u8 {
    BUCKET_LOOKUP[count as usize]
}

/// A fixed-capacity array of saturating per-point hit counters.
///
/// Two long-lived instances are kept by the guidance engine: the union of all
/// runs and the union of valid runs. Counters in those maps only ever grow;
/// per-run snapshots are plain `CoverageMap`s filled by the harness.
#[derive(Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct CoverageMap {
    counters: Vec<u8>,
}

impl CoverageMap {
    /// Creates a map of `size` zeroed counters.
    pub fn new(size: usize) -> Self {
        Self {
            counters: vec![0; size],
        }
    }

    /// Wraps a raw counter array captured from an instrumented run.
    pub fn from_counters(counters: Vec<u8>) -> Self {
        Self { counters }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn get(&self, index: usize) -> u8 {
        self.counters.get(index).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &[u8] {
        &self.counters
    }

    /// Records one hit at `index`, saturating at 255. Out-of-range indices are ignored.
    pub fn record_hit(&mut self, index: usize) {
        if let Some(counter) = self.counters.get_mut(index) {
            *counter = counter.saturating_add(1);
        }
    }

    /// ORs the bucketed value of every non-zero counter in `other` into `self`.
    ///
    /// Returns `true` if at least one counter changed. Hit counts that stay
    /// inside an already-seen power-of-two bucket do not register.
    pub fn merge(&mut self, other: &CoverageMap) -> bool {
        let mut changed = false;
        for (dst, &raw) in self.counters.iter_mut().zip(other.counters.iter()) {
            if raw == 0 {
                continue;
            }
            let after = *dst | bucket(raw);
            if after != *dst {
                *dst = after;
                changed = true;
            }
        }
        changed
    }

    /// Whether `merge(other)` would change any counter. Does not modify `self`.
    pub fn would_change(&self, other: &CoverageMap) -> bool {
        self.counters
            .iter()
            .zip(other.counters.iter())
            .any(|(&dst, &raw)| raw != 0 && dst | bucket(raw) != dst)
    }

    /// Indices that are non-zero here and zero in `baseline`.
    pub fn new_indices(&self, baseline: &CoverageMap) -> BTreeSet<usize> {
        self.counters
            .iter()
            .enumerate()
            .filter(|&(i, &count)| count != 0 && baseline.get(i) == 0)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn non_zero_count(&self) -> usize {
        self.counters.iter().filter(|&&c| c != 0).count()
    }

    /// Percentage of the map that holds a non-zero counter.
    pub fn coverage_percent(&self) -> f64 {
        if self.counters.is_empty() {
            return 0.0;
        }
        self.non_zero_count() as f64 * 100.0 / self.counters.len() as f64
    }

    /// MD5 digest of the raw counters, used to fingerprint persisted coverage state.
    pub fn digest(&self) -> [u8; 16] {
        md5::compute(&self.counters).0
    }
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_SIZE)
    }
}

impl fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageMap")
            .field("len", &self.counters.len())
            .field("non_zero", &self.non_zero_count())
            .finish()
    }
}

impl fmt::Display for CoverageMap {
    /// One `index->count` line per non-zero counter.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Coverage counts:")?;
        for (i, &count) in self.counters.iter().enumerate() {
            if count != 0 {
                writeln!(f, "{i}->{count}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(size: usize, hits: &[(usize, u8)]) -> CoverageMap {
        let mut counters = vec![0u8; size];
        for &(i, v) in hits {
            counters[i] = v;
        }
        CoverageMap::from_counters(counters)
    }

    #[test]
    fn bucket_rounds_down_to_power_of_two() {
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(1), 1);
        assert_eq!(bucket(2), 2);
        assert_eq!(bucket(3), 2);
        assert_eq!(bucket(7), 4);
        assert_eq!(bucket(8), 8);
        assert_eq!(bucket(129), 128);
        assert_eq!(bucket(255), 128);
    }

    #[test]
    fn merge_reports_change_and_is_idempotent() {
        let mut total = CoverageMap::new(16);
        let run = map_with(16, &[(1, 1), (4, 3), (9, 200)]);

        assert!(total.merge(&run), "first merge should change counters");
        assert_eq!(total.get(1), 1);
        assert_eq!(total.get(4), 2);
        assert_eq!(total.get(9), 128);

        assert!(!total.merge(&run), "merging the same snapshot twice changes nothing");
    }

    #[test]
    fn merge_only_registers_new_buckets() {
        let mut total = CoverageMap::new(4);
        total.merge(&map_with(4, &[(0, 2)]));

        assert!(!total.merge(&map_with(4, &[(0, 3)])), "3 falls in the same bucket as 2");
        assert!(total.merge(&map_with(4, &[(0, 4)])), "4 opens a higher bucket");
        assert_eq!(total.get(0), 2 | 4);
    }

    #[test]
    fn would_change_predicts_merge_without_mutating() {
        let mut total = CoverageMap::new(4);
        total.merge(&map_with(4, &[(0, 2)]));
        let same_bucket = map_with(4, &[(0, 3)]);
        let new_point = map_with(4, &[(2, 1)]);

        assert!(!total.would_change(&same_bucket));
        assert!(total.would_change(&new_point));
        assert_eq!(total.get(2), 0, "prediction leaves counters alone");
        assert_eq!(total.would_change(&new_point), total.clone().merge(&new_point));
    }

    #[test]
    fn merge_is_monotonic() {
        let mut total = CoverageMap::new(8);
        let runs = [
            map_with(8, &[(0, 5), (3, 1)]),
            map_with(8, &[(0, 1), (7, 17)]),
            map_with(8, &[(3, 255)]),
        ];
        let mut previous = total.clone();
        for run in &runs {
            total.merge(run);
            assert!(total.non_zero_count() >= previous.non_zero_count());
            for i in 0..total.len() {
                assert!(total.get(i) >= previous.get(i), "counter {i} decreased");
            }
            previous = total.clone();
        }
    }

    #[test]
    fn new_indices_are_relative_to_baseline() {
        let baseline = map_with(8, &[(1, 1), (2, 4)]);
        let run = map_with(8, &[(1, 9), (3, 1), (5, 2)]);
        let fresh: Vec<usize> = run.new_indices(&baseline).into_iter().collect();
        assert_eq!(fresh, vec![3, 5]);
    }

    #[test]
    fn non_zero_count_and_percent() {
        let map = map_with(8, &[(0, 1), (4, 1)]);
        assert_eq!(map.non_zero_count(), 2);
        assert!((map.coverage_percent() - 25.0).abs() < f64::EPSILON);
        assert_eq!(CoverageMap::new(0).coverage_percent(), 0.0);
    }

    #[test]
    fn record_hit_saturates_and_ignores_out_of_range() {
        let mut map = map_with(2, &[(0, 254)]);
        map.record_hit(0);
        map.record_hit(0);
        map.record_hit(10);
        assert_eq!(map.get(0), 255);
        assert_eq!(map.non_zero_count(), 1);
    }

    #[test]
    fn digest_tracks_raw_counters() {
        let a = map_with(8, &[(2, 1)]);
        let b = map_with(8, &[(2, 1)]);
        let c = map_with(8, &[(2, 2)]);
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn display_lists_non_zero_counters() {
        let map = map_with(8, &[(3, 4), (6, 1)]);
        let text = map.to_string();
        assert!(text.contains("3->4"));
        assert!(text.contains("6->1"));
        assert!(!text.contains("0->"));
    }
}
