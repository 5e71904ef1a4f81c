use std::collections::VecDeque;

use constant_time_eq::constant_time_eq;

/// Maximum unanswered challenges outstanding on one path. Emission stalls
/// when the ring is full until expiry frees a slot.
pub const MAX_OUTSTANDING: usize = 4;

#[derive(Debug, Copy, Clone)]
struct Entry {
    /// When this challenge stops being acceptable.
    expiry: u64,
    token: u64,
}

/// Tracks an in-progress validation of a network path.
///
/// Each emitted PATH_CHALLENGE is remembered with an expiry; a
/// PATH_RESPONSE validates the path if it echoes any live token exactly.
/// The whole validation fails once `timeout` elapses without a match.
#[derive(Debug)]
pub struct PathValidator {
    entries: VecDeque<Entry>,
    timeout: u64,
    deadline: Option<u64>,
    /// Challenges that expired unanswered.
    pub loss_count: usize,
    /// Other transmission must wait for the validation's outcome.
    pub blocking: bool,
    /// The outcome is ignored; used when probing opportunistically.
    pub dont_care: bool,
    /// Retire the destination CID used for probing once finished,
    /// regardless of outcome.
    pub retire_dcid_on_finish: bool,
}

impl PathValidator {
    pub fn new(timeout: u64) -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_OUTSTANDING),
            timeout,
            deadline: None,
            loss_count: 0,
            blocking: false,
            dont_care: false,
            retire_dcid_on_finish: false,
        }
    }

    /// Start the overall validation clock, once.
    pub fn ensure_started(&mut self, now: u64) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.timeout);
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_OUTSTANDING
    }

    /// Whether a new challenge may be emitted.
    pub fn can_send(&mut self, now: u64) -> bool {
        self.handle_expiry(now);
        !self.is_full() && !self.timed_out(now)
    }

    pub fn add_challenge(&mut self, token: u64, now: u64, expiry: u64) {
        self.ensure_started(now);
        debug_assert!(!self.is_full());
        self.entries.push_back(Entry { expiry, token });
    }

    /// Drop expired challenges, counting them as lost.
    pub fn handle_expiry(&mut self, now: u64) {
        while self.entries.front().map_or(false, |e| e.expiry <= now) {
            self.entries.pop_front();
            self.loss_count += 1;
        }
    }

    /// Check a received PATH_RESPONSE against the outstanding challenges.
    pub fn verify(&mut self, token: u64, now: u64) -> bool {
        self.handle_expiry(now);
        let token = token.to_be_bytes();
        let mut matched = false;
        // Examine every entry rather than returning on first match.
        for entry in &self.entries {
            if constant_time_eq(&entry.token.to_be_bytes(), &token) {
                matched = true;
            }
        }
        matched
    }

    /// Whether the validation as a whole has failed.
    pub fn timed_out(&self, now: u64) -> bool {
        self.deadline.map_or(false, |d| d <= now)
    }

    /// Earliest timestamp at which `handle_expiry` or `timed_out` will have
    /// new work.
    pub fn next_expiry(&self) -> Option<u64> {
        let entry = self.entries.front().map(|e| e.expiry);
        match (entry, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (x, y) => x.or(y),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_must_echo_exactly() {
        let mut pv = PathValidator::new(1_000);
        pv.add_challenge(0x0123_4567_89ab_cdef, 0, 500);
        assert!(!pv.verify(0x0123_4567_89ab_cdee, 10));
        assert!(pv.verify(0x0123_4567_89ab_cdef, 10));
    }

    #[test]
    fn expired_challenges_do_not_match() {
        let mut pv = PathValidator::new(1_000);
        pv.add_challenge(42, 0, 100);
        assert!(!pv.verify(42, 100));
        assert_eq!(pv.loss_count, 1);
    }

    #[test]
    fn ring_stalls_when_full_until_expiry() {
        let mut pv = PathValidator::new(10_000);
        for i in 0..MAX_OUTSTANDING as u64 {
            assert!(pv.can_send(0));
            pv.add_challenge(i, 0, 100 + i);
        }
        assert!(!pv.can_send(50));
        // The oldest entry expires, freeing a slot.
        assert!(pv.can_send(101));
        assert_eq!(pv.loss_count, 1);
    }

    #[test]
    fn overall_timeout_marks_failure() {
        let mut pv = PathValidator::new(1_000);
        pv.add_challenge(7, 0, 5_000);
        assert!(!pv.timed_out(999));
        assert!(pv.timed_out(1_000));
        assert!(!pv.can_send(1_000));
    }
}
