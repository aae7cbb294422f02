//! Weighted queue selection.

use std::collections::BTreeMap;

/// Smooth weighted round-robin over queue names.
///
/// Over any window of `sum(weights)` picks each queue is chosen exactly
/// `weight` times, and heavy queues are interleaved rather than drained in
/// bursts.
#[derive(Debug, Clone)]
pub struct WeightedRoundRobin {
    entries: Vec<Entry>,
    total: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    queue: String,
    weight: i64,
    current: i64,
}

impl WeightedRoundRobin {
    /// Zero weights are ignored. Heavier queues win ties.
    pub fn new(weights: &BTreeMap<String, u32>) -> Self {
        let mut entries: Vec<Entry> = weights
            .iter()
            .filter(|(_, weight)| **weight > 0)
            .map(|(queue, weight)| Entry {
                queue: queue.clone(),
                weight: i64::from(*weight),
                current: 0,
            })
            .collect();
        entries.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.queue.cmp(&b.queue)));
        let total = entries.iter().map(|e| e.weight).sum();
        Self { entries, total }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next queue to poll.
    pub fn next_queue(&mut self) -> Option<&str> {
        let mut best: Option<usize> = None;
        for i in 0..self.entries.len() {
            self.entries[i].current += self.entries[i].weight;
            match best {
                Some(b) if self.entries[b].current >= self.entries[i].current => {}
                _ => best = Some(i),
            }
        }

        let best = best?;
        self.entries[best].current -= self.total;
        Some(self.entries[best].queue.as_str())
    }

    /// The queue chosen by [`next_queue`](Self::next_queue) followed by the
    /// others in weight order, so an empty pick falls through to the rest.
    pub fn poll_order(&mut self) -> Vec<String> {
        let Some(first) = self.next_queue().map(str::to_string) else {
            return Vec::new();
        };
        let mut order = Vec::with_capacity(self.entries.len());
        order.push(first.clone());
        order.extend(
            self.entries
                .iter()
                .filter(|e| e.queue != first)
                .map(|e| e.queue.clone()),
        );
        order
    }
}
