//! Fixed-capacity ring buffer with an incrementally maintained sum.

/// Circular buffer of `N` samples.
///
/// `sum()` always equals the sum of the stored samples; it is updated by
/// `sum += new - evicted` on every push rather than rescanned.
#[derive(Debug, Clone)]
pub struct RingBuffer<const N: usize> {
    values: [f64; N],
    head: usize,
    len: usize,
    sum: f64,
    last: Option<f64>,
}

impl<const N: usize> RingBuffer<N> {
    pub const CAPACITY: usize = N;

    pub fn new() -> Self {
        Self {
            values: [0.0; N],
            head: 0,
            len: 0,
            sum: 0.0,
            last: None,
        }
    }

    /// Insert a sample, evicting the oldest one once full.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if N == 0 {
            return None;
        }
        let evicted = if self.len == N {
            Some(self.values[self.head])
        } else {
            self.len += 1;
            None
        };

        self.sum += value - evicted.unwrap_or(0.0);
        self.values[self.head] = value;
        self.head = (self.head + 1) % N;
        self.last = Some(value);
        evicted
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Mean of the stored samples, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            self.sum / self.len as f64
        }
    }

    /// Population variance of the stored samples.
    pub fn variance(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let mean = self.mean();
        self.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.len as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Most recently inserted sample.
    pub fn last(&self) -> Option<f64> {
        self.last
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = (self.head + N - self.len) % N.max(1);
        (0..self.len).map(move |i| self.values[(start + i) % N])
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_buffer() {
        let buffer = RingBuffer::<5>::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.mean(), 0.0);
        assert_eq!(buffer.std_dev(), 0.0);
        assert_eq!(buffer.last(), None);
    }

    #[test]
    fn test_eviction_order() {
        let mut buffer = RingBuffer::<3>::new();
        assert_eq!(buffer.push(1.0), None);
        assert_eq!(buffer.push(2.0), None);
        assert_eq!(buffer.push(3.0), None);
        assert!(buffer.is_full());
        assert_eq!(buffer.push(4.0), Some(1.0));
        assert_eq!(buffer.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.sum(), 9.0);
        assert_eq!(buffer.mean(), 3.0);
        assert_eq!(buffer.last(), Some(4.0));
    }

    #[test]
    fn test_mean_over_partial_fill() {
        let mut buffer = RingBuffer::<10>::new();
        buffer.push(4.0);
        buffer.push(8.0);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.mean(), 6.0);
    }

    #[test]
    fn test_std_dev() {
        let mut buffer = RingBuffer::<4>::new();
        for v in [2.0, 4.0, 4.0, 6.0] {
            buffer.push(v);
        }
        assert!((buffer.variance() - 2.0).abs() < 1e-12);
        assert!((buffer.std_dev() - 2.0f64.sqrt()).abs() < 1e-12);
    }

    // Property: the running sum matches a full rescan after any insert sequence.
    proptest! {
        #[test]
        fn prop_running_sum_matches_contents(
            samples in prop::collection::vec(-20_000.0f64..20_000.0, 0..200)
        ) {
            let mut buffer = RingBuffer::<10>::new();
            for sample in samples.iter() {
                buffer.push(*sample);
                let rescanned: f64 = buffer.iter().sum();
                prop_assert!((buffer.sum() - rescanned).abs() < 1e-6,
                    "running sum {} drifted from contents {}", buffer.sum(), rescanned);
                prop_assert!(buffer.len() <= 10);
            }

            let expected_len = samples.len().min(10);
            prop_assert_eq!(buffer.len(), expected_len);
            let tail: Vec<f64> = samples[samples.len() - expected_len..].to_vec();
            prop_assert_eq!(buffer.iter().collect::<Vec<_>>(), tail);
        }
    }
}
