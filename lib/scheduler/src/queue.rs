//! Per-agent admission queue.
//!
//! Candidates that are ready but cannot start yet wait here. The order is
//! priority class (highest first), then window start (oldest first), then
//! arrival. Retries carry a `not_before` instant and are skipped until it
//! passes.

use crate::run::{PriorityClass, RunTrigger};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use trendline_core::TimeWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCandidate {
    pub window: TimeWindow,
    pub priority: PriorityClass,
    pub trigger: RunTrigger,
    pub enqueued_at: DateTime<Utc>,
    /// Arrival order, used as the final tie-breaker.
    pub seq: u64,
    /// Earliest start for retries.
    pub not_before: Option<DateTime<Utc>>,
}

impl QueuedCandidate {
    fn order_key(&self) -> (Reverse<PriorityClass>, DateTime<Utc>, u64) {
        (Reverse(self.priority), self.window.start(), self.seq)
    }

    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionQueue {
    entries: Vec<QueuedCandidate>,
    next_seq: u64,
}

impl AdmissionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a candidate and returns its 1-based position among all
    /// queued candidates.
    pub fn push(
        &mut self,
        window: TimeWindow,
        priority: PriorityClass,
        trigger: RunTrigger,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueuedCandidate {
            window,
            priority,
            trigger,
            enqueued_at: now,
            seq,
            not_before,
        });
        self.sort();
        self.position(&window).unwrap_or(self.entries.len())
    }

    /// Puts back a candidate that was popped but could not start, keeping
    /// its place in line.
    pub fn restore(&mut self, candidate: QueuedCandidate) {
        self.entries.push(candidate);
        self.sort();
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(QueuedCandidate::order_key);
    }

    /// Removes and returns the best candidate whose `not_before` has passed.
    pub fn pop_eligible(&mut self, now: DateTime<Utc>) -> Option<QueuedCandidate> {
        let index = self.entries.iter().position(|c| c.is_eligible(now))?;
        Some(self.entries.remove(index))
    }

    #[must_use]
    pub fn position(&self, window: &TimeWindow) -> Option<usize> {
        self.entries
            .iter()
            .position(|c| c.window == *window)
            .map(|index| index + 1)
    }

    #[must_use]
    pub fn contains(&self, window: &TimeWindow) -> bool {
        self.entries.iter().any(|c| c.window == *window)
    }

    pub fn remove(&mut self, window: &TimeWindow) -> Option<QueuedCandidate> {
        let index = self.entries.iter().position(|c| c.window == *window)?;
        Some(self.entries.remove(index))
    }

    /// Promotes Normal candidates queued for longer than `max_wait` to
    /// Expedited. Returns how many were promoted.
    pub fn promote_aged(&mut self, now: DateTime<Utc>, max_wait: Duration) -> usize {
        let mut promoted = 0;
        for candidate in &mut self.entries {
            if candidate.priority == PriorityClass::Normal && now - candidate.enqueued_at > max_wait
            {
                candidate.priority = PriorityClass::Expedited;
                promoted += 1;
            }
        }
        if promoted > 0 {
            self.sort();
        }
        promoted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidates waiting out a retry backoff.
    #[must_use]
    pub fn retry_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|c| c.trigger == RunTrigger::Retry)
            .count()
    }

    /// Earliest instant a retry becomes eligible, if any is still waiting.
    #[must_use]
    pub fn next_eligible_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(|c| c.not_before)
            .filter(|at| *at > now)
            .min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedCandidate> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn window(hour: u32) -> TimeWindow {
        TimeWindow::new(at(hour, 0), at(hour + 1, 0)).unwrap()
    }

    #[test]
    fn orders_by_priority_then_age_then_arrival() {
        let mut queue = AdmissionQueue::new();
        let now = at(15, 0);
        queue.push(window(12), PriorityClass::Normal, RunTrigger::Cadence, now, None);
        queue.push(window(10), PriorityClass::Normal, RunTrigger::Manual, now, None);
        queue.push(window(14), PriorityClass::Emergency, RunTrigger::Cadence, now, None);
        queue.push(window(13), PriorityClass::Expedited, RunTrigger::Cadence, now, None);

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop_eligible(now))
            .map(|c| c.window.start().hour())
            .collect();
        assert_eq!(order, vec![14, 13, 10, 12]);
    }

    #[test]
    fn push_reports_position() {
        let mut queue = AdmissionQueue::new();
        let now = at(15, 0);
        assert_eq!(
            queue.push(window(12), PriorityClass::Normal, RunTrigger::Cadence, now, None),
            1
        );
        assert_eq!(
            queue.push(window(13), PriorityClass::Normal, RunTrigger::Cadence, now, None),
            2
        );
        assert_eq!(
            queue.push(window(14), PriorityClass::Emergency, RunTrigger::Cadence, now, None),
            1
        );
        assert_eq!(queue.position(&window(13)), Some(3));
    }

    #[test]
    fn retries_wait_for_backoff() {
        let mut queue = AdmissionQueue::new();
        queue.push(
            window(10),
            PriorityClass::Normal,
            RunTrigger::Retry,
            at(11, 0),
            Some(at(11, 5)),
        );
        assert_eq!(queue.pop_eligible(at(11, 1)), None);
        assert_eq!(queue.next_eligible_at(at(11, 1)), Some(at(11, 5)));
        assert_eq!(queue.retry_count(), 1);
        assert!(queue.pop_eligible(at(11, 5)).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn restore_keeps_place_in_line() {
        let mut queue = AdmissionQueue::new();
        let now = at(15, 0);
        queue.push(window(12), PriorityClass::Normal, RunTrigger::Cadence, now, None);
        queue.push(window(13), PriorityClass::Normal, RunTrigger::Cadence, now, None);
        let first = queue.pop_eligible(now).unwrap();
        queue.restore(first.clone());
        assert_eq!(queue.pop_eligible(now), Some(first));
    }

    #[test]
    fn aged_normal_candidates_are_expedited() {
        let mut queue = AdmissionQueue::new();
        queue.push(window(10), PriorityClass::Normal, RunTrigger::Cadence, at(11, 0), None);
        queue.push(window(11), PriorityClass::Normal, RunTrigger::Cadence, at(11, 40), None);

        assert_eq!(queue.promote_aged(at(11, 45), Duration::minutes(30)), 1);
        let priorities: Vec<PriorityClass> = queue.iter().map(|c| c.priority).collect();
        assert_eq!(
            priorities,
            vec![PriorityClass::Expedited, PriorityClass::Normal]
        );
        assert!(queue.remove(&window(11)).is_some());
        assert!(!queue.contains(&window(11)));
    }
}
