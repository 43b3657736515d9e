use crate::classifier::cosine_similarity;
use crate::error::{LeafcareError, Result};
use crate::types::MemoryRecord;
use std::collections::VecDeque;
use tracing::debug;

/// Maximum number of matches returned by `find_similar`
pub const MAX_SIMILAR: usize = 5;

/// Fixed-capacity FIFO of confirmed high-confidence cases
#[derive(Debug)]
pub struct BoundedSimilarityMemory {
    records: VecDeque<MemoryRecord>,
    capacity: usize,
    add_threshold: f64,
    query_threshold: f64,
}

impl BoundedSimilarityMemory {
    pub fn new(capacity: usize, add_threshold: f64, query_threshold: f64) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            add_threshold,
            query_threshold,
        }
    }

    /// Store a case if its confidence exceeds the acceptance threshold.
    /// Returns whether the record was stored.
    pub fn add(
        &mut self,
        embedding: &[f32],
        prediction: &str,
        confidence: f64,
        true_label: &str,
    ) -> bool {
        if confidence <= self.add_threshold || self.capacity == 0 {
            return false;
        }

        while self.records.len() >= self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                debug!(
                    "Evicted memory record for {} (capacity {})",
                    evicted.true_label, self.capacity
                );
            }
        }

        self.records.push_back(MemoryRecord {
            embedding: embedding.to_vec(),
            prediction: prediction.to_string(),
            confidence,
            true_label: true_label.to_string(),
            recorded_at: chrono::Utc::now(),
        });
        true
    }

    /// Records more similar than the default query threshold
    pub fn find_similar(&self, embedding: &[f32]) -> Vec<(f64, &MemoryRecord)> {
        self.find_similar_above(embedding, self.query_threshold)
    }

    /// Records with similarity strictly above `threshold`, best first, at most five
    pub fn find_similar_above(&self, embedding: &[f32], threshold: f64) -> Vec<(f64, &MemoryRecord)> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut matches: Vec<(f64, &MemoryRecord)> = self
            .records
            .iter()
            .map(|record| (cosine_similarity(embedding, &record.embedding), record))
            .filter(|(similarity, _)| *similarity > threshold)
            .collect();

        // stable sort keeps older records first among ties
        matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(MAX_SIMILAR);
        matches
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest
    #[allow(dead_code)]
    pub fn records(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.iter()
    }

    pub fn check_capacity(&self) -> Result<()> {
        if self.len() > self.capacity() {
            return Err(LeafcareError::CapacityInvariant {
                store: "similarity memory",
                len: self.records.len(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(capacity: usize) -> BoundedSimilarityMemory {
        BoundedSimilarityMemory::new(capacity, 0.85, 0.7)
    }

    #[test]
    fn test_add_respects_threshold() {
        let mut mem = memory(10);
        assert!(!mem.add(&[1.0, 0.0], "Healthy", 0.85, "Healthy"));
        assert!(!mem.add(&[1.0, 0.0], "Healthy", 0.5, "Healthy"));
        assert!(mem.is_empty());

        assert!(mem.add(&[1.0, 0.0], "Healthy", 0.86, "Healthy"));
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_fifo_eviction() {
        let mut mem = memory(3);
        for i in 0..5 {
            mem.add(&[1.0, i as f32], &format!("p{}", i), 0.9, &format!("t{}", i));
            assert!(mem.len() <= mem.capacity());
            assert!(mem.check_capacity().is_ok());
        }

        assert_eq!(mem.len(), 3);
        let labels: Vec<&str> = mem.records().map(|r| r.true_label.as_str()).collect();
        assert_eq!(labels, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn test_find_similar_on_empty_memory() {
        let mem = memory(10);
        assert!(mem.find_similar(&[1.0, 0.0, 0.0]).is_empty());
    }

    #[test]
    fn test_find_similar_orders_and_filters() {
        let mut mem = memory(10);
        mem.add(&[1.0, 0.0], "a", 0.9, "a"); // similarity 1.0
        mem.add(&[0.0, 1.0], "b", 0.9, "b"); // similarity 0.0
        mem.add(&[1.0, 0.5], "c", 0.9, "c"); // similarity ~0.894
        mem.add(&[1.0, 1.0], "d", 0.9, "d"); // similarity ~0.707

        let found = mem.find_similar(&[1.0, 0.0]);
        let labels: Vec<&str> = found.iter().map(|(_, r)| r.true_label.as_str()).collect();
        assert_eq!(labels, vec!["a", "c", "d"]);
        assert!(found.windows(2).all(|w| w[0].0 >= w[1].0));

        // threshold is exclusive
        let strict = mem.find_similar_above(&[1.0, 0.0], 1.0);
        assert!(strict.is_empty());
    }

    #[test]
    fn test_find_similar_truncates_to_five() {
        let mut mem = memory(20);
        for i in 0..8 {
            mem.add(&[1.0, 0.01 * i as f32], "x", 0.95, "x");
        }
        assert_eq!(mem.find_similar(&[1.0, 0.0]).len(), MAX_SIMILAR);
    }
}
