//! History of accepted scans.
//!
//! Keeps the most recent accepted scans and derives simple statistics
//! from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::types::ScanResult;

/// Default number of accepted scans retained.
pub const DEFAULT_HISTORY_LEN: usize = 15;

/// One accepted scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub card_name: String,
    pub set: String,
    pub rarity: String,
    pub confidence: f64,
    pub model_version: String,
}

impl From<&ScanResult> for HistoryEntry {
    fn from(result: &ScanResult) -> Self {
        Self {
            timestamp: Utc::now(),
            card_name: result.card_name.clone(),
            set: result.set.clone(),
            rarity: result.rarity.clone(),
            confidence: result.confidence,
            model_version: result.model_version.clone(),
        }
    }
}

/// Aggregate statistics over the retained history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScanStats {
    pub total_scans: usize,
    pub average_confidence: f64,
    pub most_scanned_card: Option<String>,
    pub most_common_set: Option<String>,
    pub last_scan: Option<DateTime<Utc>>,
}

/// Bounded history of accepted scans, oldest first.
#[derive(Debug, Clone)]
pub struct ScanHistory {
    entries: VecDeque<HistoryEntry>,
    max_len: usize,
}

impl ScanHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_len),
            max_len: max_len.max(1),
        }
    }

    /// Record an accepted scan, evicting the oldest when full.
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.max_len {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::trace!(card = %evicted.card_name, "Evicted oldest history entry");
            }
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `limit` entries (all when `None`), oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let skip = limit
            .map(|l| self.entries.len().saturating_sub(l))
            .unwrap_or(0);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> ScanStats {
        if self.entries.is_empty() {
            return ScanStats::default();
        }

        let total = self.entries.len();
        let sum: f64 = self.entries.iter().map(|e| e.confidence).sum();
        let average = ((sum / total as f64) * 100.0).round() / 100.0;

        ScanStats {
            total_scans: total,
            average_confidence: average,
            most_scanned_card: most_common(self.entries.iter().map(|e| e.card_name.as_str())),
            most_common_set: most_common(self.entries.iter().map(|e| e.set.as_str())),
            last_scan: self.entries.back().map(|e| e.timestamp),
        }
    }
}

impl Default for ScanHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

/// Most frequent value; ties go to the value seen first.
fn most_common<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (index, value) in values.enumerate() {
        counts.entry(value).or_insert((0, index)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(value, _)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, set: &str, confidence: f64) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            card_name: name.to_string(),
            set: set.to_string(),
            rarity: "Common".to_string(),
            confidence,
            model_version: "v1".to_string(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = ScanHistory::new(3);
        for i in 0..5 {
            history.record(entry(&format!("card-{}", i), "Base", 0.9));
        }
        assert_eq!(history.len(), 3);
        let names: Vec<_> = history.recent(None).into_iter().map(|e| e.card_name).collect();
        assert_eq!(names, vec!["card-2", "card-3", "card-4"]);
        assert_eq!(history.recent(Some(1))[0].card_name, "card-4");
    }

    #[test]
    fn test_stats() {
        let mut history = ScanHistory::default();
        assert_eq!(history.stats().total_scans, 0);

        history.record(entry("Pikachu", "Base", 0.9));
        history.record(entry("Charmander", "Jungle", 0.8));
        history.record(entry("Pikachu", "Jungle", 0.75));

        let stats = history.stats();
        assert_eq!(stats.total_scans, 3);
        assert_eq!(stats.average_confidence, 0.82);
        assert_eq!(stats.most_scanned_card.as_deref(), Some("Pikachu"));
        assert_eq!(stats.most_common_set.as_deref(), Some("Jungle"));
        assert!(stats.last_scan.is_some());
    }

    #[test]
    fn test_most_common_tie_goes_to_first() {
        let values = ["b", "a", "a", "b"];
        assert_eq!(most_common(values.iter().copied()).as_deref(), Some("b"));
    }
}
