//! Percentile calculations over bounded sample windows
//!
//! Percentiles are computed from raw samples using linear interpolation
//! between order statistics, the same definition numpy uses by default.

use std::collections::VecDeque;

/// Percentile calculation result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Calculate a percentile from ascending-sorted samples
///
/// # Arguments
/// * `sorted` - Samples sorted ascending
/// * `percentile` - Percentile to calculate (0.0 to 100.0, e.g. 95.0 for P95)
///
/// # Algorithm
/// 1. index = percentile / 100 × (n − 1)
/// 2. If index is integral, return that element
/// 3. Otherwise interpolate linearly between the two neighbours
pub fn percentile_sorted(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() || percentile.is_nan() {
        return None;
    }

    let percentile = percentile.clamp(0.0, 100.0);
    let index = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        return Some(sorted[lower]);
    }

    let fraction = index - lower as f64;
    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

/// Sort a copy of `samples` and calculate one percentile
pub fn percentile(samples: &[f64], percentile: f64) -> Option<f64> {
    let mut sorted = samples.to_vec();
    sort_samples(&mut sorted);
    percentile_sorted(&sorted, percentile)
}

/// Calculate P50, P95 and P99 from ascending-sorted samples
pub fn calculate_percentiles(sorted: &[f64]) -> Option<Percentiles> {
    Some(Percentiles {
        p50: percentile_sorted(sorted, 50.0)?,
        p95: percentile_sorted(sorted, 95.0)?,
        p99: percentile_sorted(sorted, 99.0)?,
    })
}

pub fn sort_samples(samples: &mut [f64]) {
    samples.sort_by(|a, b| a.total_cmp(b));
}

/// Lifetime bucket counters for one histogram series.
///
/// Unlike the sample window these never forget an observation, so the
/// cumulative counts only ever grow.
#[derive(Debug, Clone)]
pub struct BucketCounts {
    bounds: Vec<f64>,
    /// One slot per bound plus a trailing `+Inf` slot
    counts: Vec<u64>,
}

impl BucketCounts {
    /// `bounds` must be ascending
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            counts: vec![0; bounds.len() + 1],
        }
    }

    pub fn observe(&mut self, value: f64) {
        let slot = self.bounds.partition_point(|bound| *bound < value);
        self.counts[slot] += 1;
    }

    /// Cumulative counts (`le` semantics), one entry per bound plus a final
    /// `+Inf` entry
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        self.bounds
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(&self.counts)
            .map(|(bound, count)| {
                running += count;
                (bound, running)
            })
            .collect()
    }
}

/// Fixed-size FIFO window of the most recent samples
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            samples: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Record a sample, dropping the oldest when full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sorted copy of the window
    pub fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sort_samples(&mut sorted);
        sorted
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_to_ten() -> Vec<f64> {
        (1..=10).map(|v| v as f64).collect()
    }

    #[test]
    fn test_percentile_empty_samples() {
        assert_eq!(percentile(&[], 50.0), None);
        assert!(calculate_percentiles(&[]).is_none());
    }

    #[test]
    fn test_percentile_one_to_ten() {
        let sorted = one_to_ten();

        // index = 0.5 * 9 = 4.5 -> halfway between 5 and 6
        assert_eq!(percentile_sorted(&sorted, 50.0), Some(5.5));
        // index = 9 -> the maximum
        assert_eq!(percentile_sorted(&sorted, 100.0), Some(10.0));
        assert_eq!(percentile_sorted(&sorted, 0.0), Some(1.0));

        // P95: index = 8.55 -> 9 + 0.55 * (10 - 9) = 9.55
        let p95 = percentile_sorted(&sorted, 95.0).unwrap();
        assert!((p95 - 9.55).abs() < 1e-9);

        // P99: index = 8.91 -> 9.91
        let p99 = percentile_sorted(&sorted, 99.0).unwrap();
        assert!((p99 - 9.91).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_integral_index_returns_element() {
        // n = 5, P25: index = 0.25 * 4 = 1.0 -> element 1
        let sorted = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile_sorted(&sorted, 25.0), Some(20.0));
        assert_eq!(percentile_sorted(&sorted, 75.0), Some(40.0));
    }

    #[test]
    fn test_percentile_sorts_input() {
        let shuffled = [7.0, 1.0, 10.0, 3.0, 2.0, 9.0, 4.0, 8.0, 6.0, 5.0];
        assert_eq!(percentile(&shuffled, 50.0), Some(5.5));
    }

    #[test]
    fn test_percentile_single_sample() {
        let p = calculate_percentiles(&[42.0]).unwrap();
        assert_eq!(p.p50, 42.0);
        assert_eq!(p.p99, 42.0);
    }

    #[test]
    fn test_bucket_counts_are_cumulative() {
        let mut buckets = BucketCounts::new(&[0.01, 0.1, 1.0]);
        for v in [0.001, 0.02, 0.02, 0.3, 7.0, 1.0] {
            buckets.observe(v);
        }
        assert_eq!(
            buckets.cumulative(),
            vec![(0.01, 1), (0.1, 3), (1.0, 5), (f64::INFINITY, 6)]
        );
    }

    #[test]
    fn test_sample_window_drops_oldest() {
        let mut window = SampleWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }
}
