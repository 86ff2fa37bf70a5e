//! Advisory password-quality scoring.
//!
//! The estimate itself is synchronous and cheap. `QualityScorer` runs it on
//! a background thread against an immutable snapshot of the input; a result
//! is applied only when no newer input has superseded it, so scores are
//! never delivered out of order.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Charset-class entropy estimate in bits, with penalties for repeated and
/// sequential characters.
pub fn estimate_bits(password: &str) -> f64 {
    if password.is_empty() {
        return 0.0;
    }
    let mut space = 0usize;
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        space += 26;
    }
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        space += 26;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        space += 10;
    }
    if password.chars().any(|c| c.is_ascii_punctuation()) {
        space += 33;
    }
    if password.chars().any(|c| !c.is_ascii()) {
        space += 128;
    }
    if space == 0 {
        space = 26;
    }

    let chars: Vec<char> = password.chars().collect();
    let mut effective = chars.len() as f64;
    for pair in chars.windows(2) {
        let delta = pair[1] as i32 - pair[0] as i32;
        // Runs and keyboard-walk sequences carry little entropy.
        if delta.abs() <= 1 {
            effective -= 0.5;
        }
    }
    effective.max(1.0) * (space as f64).log2()
}

struct Slot {
    generation: u64,
    bits: f64,
}

/// Background scorer with stale-result suppression.
pub struct QualityScorer {
    generation: Arc<AtomicU64>,
    result: Arc<Mutex<Option<Slot>>>,
}

impl QualityScorer {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// Score `password` in the background. The returned handle is mainly
    /// for tests and shutdown joins; results land via [`Self::latest`].
    pub fn submit(&self, password: &str) -> JoinHandle<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = password.to_string();
        let current = Arc::clone(&self.generation);
        let result = Arc::clone(&self.result);
        std::thread::spawn(move || {
            let bits = estimate_bits(&snapshot);
            // Discard when a newer submission has superseded this one.
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let mut slot = result.lock();
            let stale = slot
                .as_ref()
                .map(|s| s.generation > generation)
                .unwrap_or(false);
            if !stale {
                *slot = Some(Slot { generation, bits });
            }
        })
    }

    /// Most recent non-superseded score, if any has completed.
    pub fn latest(&self) -> Option<f64> {
        self.result.lock().as_ref().map(|s| s.bits)
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longer_and_richer_passwords_score_higher() {
        let weak = estimate_bits("aaaa");
        let medium = estimate_bits("wvkcifne");
        let strong = estimate_bits("wV9!kc#fNe27tq");
        assert!(weak < medium);
        assert!(medium < strong);
    }

    #[test]
    fn sequences_are_penalized() {
        assert!(estimate_bits("abcdefgh") < estimate_bits("qmwxvznu"));
    }

    #[test]
    fn empty_password_scores_zero() {
        assert_eq!(estimate_bits(""), 0.0);
    }

    #[test]
    fn background_result_matches_direct_call() {
        let scorer = QualityScorer::new();
        scorer.submit("tr0ub4dor&3").join().unwrap();
        assert_eq!(scorer.latest(), Some(estimate_bits("tr0ub4dor&3")));
    }

    #[test]
    fn superseded_submission_never_overwrites_newer_result() {
        let scorer = QualityScorer::new();
        let first = scorer.submit("first input");
        let second = scorer.submit("second input");
        first.join().unwrap();
        second.join().unwrap();
        // Whatever the completion order, the surviving score is the newest.
        assert_eq!(scorer.latest(), Some(estimate_bits("second input")));
    }
}
