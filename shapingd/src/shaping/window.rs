/// Fixed-capacity ring of per-tick counters.
///
/// The bucket at `head` is the interval still accumulating; every other
/// bucket holds the finalized sum of a past interval. The ring keeps
/// `capacity` finalized buckets in addition to the current one, so a window
/// of `capacity` ticks can always be answered from completed data.
///
/// Not thread-safe on its own; callers hold the lock of whatever owns it.
#[derive(Debug, Clone)]
pub struct SlidingWindowRing {
    buckets: Vec<u64>,
    head: usize,
    capacity: usize,
    // Finalized buckets available, saturating at `capacity`.
    completed: usize,
    tick_secs: f64,
}

impl SlidingWindowRing {
    pub fn new(max_history_secs: f64, tick_interval_secs: f64) -> Self {
        let capacity = if tick_interval_secs > 0.0 && max_history_secs > 0.0 {
            ((max_history_secs / tick_interval_secs).round() as usize).max(1)
        } else {
            1
        };
        let tick_secs = if tick_interval_secs > 0.0 {
            tick_interval_secs
        } else {
            1.0
        };

        Self {
            buckets: vec![0; capacity + 1],
            head: 0,
            capacity,
            completed: 0,
            tick_secs,
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add to the current interval.
    pub fn add(&mut self, amount: u64) {
        let bucket = &mut self.buckets[self.head];
        *bucket = bucket.saturating_add(amount);
    }

    /// Finalize the current interval and start a new, empty one. Must be
    /// called exactly once per tick interval.
    pub fn tick(&mut self) {
        self.head = (self.head + 1) % self.buckets.len();
        self.buckets[self.head] = 0;
        if self.completed < self.capacity {
            self.completed += 1;
        }
    }

    /// Average per-second rate over the most recent `seconds`.
    ///
    /// An empty head bucket is skipped so an interval that just started does
    /// not drag the rate down. The divisor is the time actually covered by
    /// the buckets summed.
    pub fn rate(&self, seconds: f64) -> f64 {
        if seconds <= 0.0 {
            return 0.0;
        }

        let wanted = ((seconds / self.tick_secs).round() as usize).clamp(1, self.capacity);
        let mut sum: u64 = 0;
        let mut summed = 0usize;

        let current = self.buckets[self.head];
        if current != 0 {
            sum = sum.saturating_add(current);
            summed += 1;
        }

        for value in self.completed_newest_first().take(wanted - summed) {
            sum = sum.saturating_add(value);
            summed += 1;
        }

        if summed == 0 {
            return 0.0;
        }
        sum as f64 / (summed as f64 * self.tick_secs)
    }

    pub fn max(&self) -> u64 {
        self.completed_newest_first().max().unwrap_or(0)
    }

    pub fn min(&self) -> u64 {
        self.completed_newest_first().min().unwrap_or(0)
    }

    pub fn mean(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .completed_newest_first()
            .fold(0u64, |acc, v| acc.saturating_add(v));
        sum as f64 / self.completed as f64
    }

    fn completed_newest_first(&self) -> impl Iterator<Item = u64> + '_ {
        let len = self.buckets.len();
        (1..=self.completed).map(move |back| self.buckets[(self.head + len - back) % len])
    }
}
