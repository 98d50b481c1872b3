// src/control/history.rs
//
// Rolling window of per-tick feature vectors. Feeds the forecaster its
// input sequence and provides the rolling demand means used when building
// the next feature vector.

use super::features::FeatureVector;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 60;

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<FeatureVector>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a vector, evicting the oldest entry when full.
    pub fn append(&mut self, vector: FeatureVector) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(vector);
    }

    /// Cold-start warm-up: repeat `vector` until the buffer is full so the
    /// forecaster can run on the very first tick.
    pub fn pad_to_capacity(&mut self, vector: &FeatureVector) {
        while self.entries.len() < self.capacity {
            self.entries.push_back(vector.clone());
        }
    }

    /// Full ordered sequence, most recent last.
    pub fn snapshot(&self) -> Vec<FeatureVector> {
        self.entries.iter().cloned().collect()
    }

    /// Mean of `field` over the last `window` entries (fewer if the buffer
    /// holds fewer). 0.0 for an empty buffer or an out-of-range field.
    pub fn rolling_mean(&self, field: usize, window: usize) -> f64 {
        let n = window.min(self.entries.len());
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .entries
            .iter()
            .rev()
            .take(n)
            .map(|v| v.get(field).unwrap_or(0.0))
            .sum();
        sum / n as f64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&FeatureVector> {
        self.entries.back()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::features::FEATURE_COUNT;
    use proptest::prelude::*;

    fn vector_with_first(v: f64) -> FeatureVector {
        let mut fields = [0.0; FEATURE_COUNT];
        fields[0] = v;
        FeatureVector::from_fields(fields)
    }

    #[test]
    fn test_evicts_oldest_on_overflow() {
        let mut history = HistoryBuffer::with_capacity(3);
        for i in 0..5 {
            history.append(vector_with_first(i as f64));
        }
        assert_eq!(history.len(), 3);
        let firsts: Vec<f64> = history.snapshot().iter().map(|v| v.fields()[0]).collect();
        assert_eq!(firsts, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rolling_mean_partial_window() {
        let mut history = HistoryBuffer::new();
        assert_eq!(history.rolling_mean(0, 10), 0.0);
        history.append(vector_with_first(2.0));
        history.append(vector_with_first(4.0));
        assert_eq!(history.rolling_mean(0, 10), 3.0);
        assert_eq!(history.rolling_mean(0, 1), 4.0);
    }

    #[test]
    fn test_pad_to_capacity_repeats_vector() {
        let mut history = HistoryBuffer::with_capacity(5);
        history.append(vector_with_first(1.0));
        history.pad_to_capacity(&vector_with_first(7.0));
        assert!(history.is_full());
        assert_eq!(history.snapshot()[0].fields()[0], 1.0);
        assert_eq!(history.latest().unwrap().fields()[0], 7.0);
    }

    proptest! {
        #[test]
        fn prop_capacity_and_rolling_mean(values in prop::collection::vec(0.0f64..500.0, 60..200)) {
            let mut history = HistoryBuffer::new();
            for v in &values {
                history.append(vector_with_first(*v));
                prop_assert!(history.len() <= DEFAULT_CAPACITY);
            }
            let tail = &values[values.len() - 10..];
            let expected = tail.iter().sum::<f64>() / 10.0;
            prop_assert!((history.rolling_mean(0, 10) - expected).abs() < 1e-9);
        }
    }
}
