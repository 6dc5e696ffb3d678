use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    /// The queue just crossed the soft limit.
    pub soft_limit_crossed: bool,
    /// Oldest items shed to stay within the hard limit.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub soft_limit_warnings: u64,
    pub dropped_total: u64,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    over_soft_limit: bool,
    soft_limit_warnings: u64,
    dropped_total: u64,
}

/// Inbound queue that never blocks the producer.
///
/// Above `soft_limit` a warning is logged once until the queue drains.
/// Above `hard_limit` the oldest items are dropped.
#[derive(Debug)]
pub struct ReportQueue<T> {
    soft_limit: usize,
    hard_limit: usize,
    state: Mutex<QueueState<T>>,
}

impl<T> ReportQueue<T> {
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            soft_limit,
            hard_limit: hard_limit.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                over_soft_limit: false,
                soft_limit_warnings: 0,
                dropped_total: 0,
            }),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let len = {
            let mut state = self.state.lock();
            state.items.push_back(item);

            while state.items.len() > self.hard_limit {
                state.items.pop_front();
                outcome.dropped += 1;
            }
            state.dropped_total += outcome.dropped as u64;

            if state.items.len() > self.soft_limit && !state.over_soft_limit {
                state.over_soft_limit = true;
                state.soft_limit_warnings += 1;
                outcome.soft_limit_crossed = true;
            }
            state.items.len()
        };

        if outcome.soft_limit_crossed {
            log::warn!(
                "Report queue has {} pending reports (soft limit {})",
                len,
                self.soft_limit
            );
        }
        if outcome.dropped > 0 {
            log::warn!(
                "Report queue full ({}), dropped {} oldest report(s)",
                self.hard_limit,
                outcome.dropped
            );
        }
        outcome
    }

    /// Take every queued item, oldest first, leaving the queue empty.
    pub fn drain(&self) -> VecDeque<T> {
        let mut state = self.state.lock();
        state.over_soft_limit = false;
        mem::take(&mut state.items)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            len: state.items.len(),
            soft_limit_warnings: state.soft_limit_warnings,
            dropped_total: state.dropped_total,
        }
    }
}
