//! Cache admission gate
//!
//! A content id is worth caching only once it has been requested at least
//! `threshold` times within a sliding window. With the default threshold of
//! one, every request is admitted and the gate keeps no state.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ids tracked before stale windows are swept
const SWEEP_AT: usize = 10_000;

/// Sliding-window request counter per content id
#[derive(Debug)]
pub struct AdmissionGate {
    threshold: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl AdmissionGate {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Gate that admits everything
    pub fn always() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count one request for `content_id` and report whether it is admitted
    pub fn record_and_admit(&self, content_id: &str) -> bool {
        self.record_at(content_id, Instant::now())
    }

    pub fn record_at(&self, content_id: &str, now: Instant) -> bool {
        if self.threshold <= 1 {
            return true;
        }

        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        let window = self.window;
        let fresh = |t: &Instant| now.saturating_duration_since(*t) < window;

        if hits.len() >= SWEEP_AT {
            hits.retain(|_, q| q.back().map(fresh).unwrap_or(false));
        }

        let queue = hits.entry(content_id.to_string()).or_default();
        while queue.front().map(|t| !fresh(t)).unwrap_or(false) {
            queue.pop_front();
        }
        queue.push_back(now);

        queue.len() as u32 >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_admits_everything() {
        let gate = AdmissionGate::always();
        assert!(gate.record_and_admit("abc"));
        assert!(gate.record_and_admit("abc"));
        assert_eq!(gate.threshold(), 1);
    }

    #[test]
    fn test_threshold_reached_within_window() {
        let gate = AdmissionGate::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(!gate.record_at("abc", t0));
        assert!(!gate.record_at("abc", t0 + Duration::from_secs(1)));
        assert!(gate.record_at("abc", t0 + Duration::from_secs(2)));
        // Other ids are counted separately
        assert!(!gate.record_at("xyz", t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_old_requests_fall_out_of_window() {
        let gate = AdmissionGate::new(2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(!gate.record_at("abc", t0));
        assert!(!gate.record_at("abc", t0 + Duration::from_secs(30)));
        assert!(gate.record_at("abc", t0 + Duration::from_secs(35)));
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let gate = AdmissionGate::new(0, Duration::from_secs(10));
        assert_eq!(gate.threshold(), 1);
        assert!(gate.record_and_admit("abc"));
    }
}
