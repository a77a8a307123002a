//! One timed unit of gameplay: submissions against a deadline, resolved
//! exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::content::RoundContent;
use crate::rules::GameVariant;

#[derive(Debug, Clone)]
pub struct Submission {
    pub text: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct Round {
    /// Session-scoped identity; a new round always gets a fresh value so
    /// work scheduled for an older round can recognize it was superseded.
    pub seq: u64,
    pub number: u32,
    pub content: RoundContent,
    pub responsible: String,
    pub started_at: Instant,
    pub deadline: Instant,
    pub window: Duration,
    /// Time left on the clock while the session is paused.
    pub paused_remaining: Option<Duration>,
    pub submissions: HashMap<String, Submission>,
    pub resolved: bool,
}

/// What a resolution produced: who was right, what everyone gets, and the
/// raw submissions (`None` marks an eligible player who never answered).
#[derive(Debug)]
pub struct RoundOutcome {
    pub correct: Vec<String>,
    pub deltas: HashMap<String, u32>,
    pub submissions: HashMap<String, Option<String>>,
}

impl Round {
    pub fn new(
        seq: u64,
        number: u32,
        content: RoundContent,
        responsible: String,
        now: Instant,
        window: Duration,
    ) -> Self {
        Self {
            seq,
            number,
            content,
            responsible,
            started_at: now,
            deadline: now + window,
            window,
            paused_remaining: None,
            submissions: HashMap::new(),
            resolved: false,
        }
    }

    pub fn answer(&self) -> &str {
        self.content.answer()
    }

    /// Last write wins until the round resolves.
    pub fn record(&mut self, player: &str, text: String, at: Instant) {
        self.submissions.insert(player.to_string(), Submission { text, at });
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn pause(&mut self, now: Instant) {
        self.paused_remaining = Some(self.remaining(now));
    }

    /// Re-arm the deadline with the time left at pause. Returns the new
    /// remaining window, or `None` if the round was never paused.
    pub fn resume(&mut self, now: Instant) -> Option<Duration> {
        let remaining = self.paused_remaining.take()?;
        self.deadline = now + remaining;
        Some(remaining)
    }

    /// Score the round against the given eligible players. Idempotent: a
    /// second call returns `None` and changes nothing.
    pub fn resolve(&mut self, variant: GameVariant, eligible: &[String]) -> Option<RoundOutcome> {
        if self.resolved {
            return None;
        }
        self.resolved = true;

        let mut correct = Vec::new();
        let mut deltas = HashMap::new();
        let mut submissions = HashMap::new();
        for name in eligible {
            match self.submissions.get(name) {
                Some(submission) => {
                    submissions.insert(name.clone(), Some(submission.text.clone()));
                    if variant.is_correct(&submission.text, self.answer()) {
                        let elapsed = submission.at.saturating_duration_since(self.started_at);
                        deltas.insert(name.clone(), variant.answer_points(elapsed, self.window));
                        correct.push(name.clone());
                    }
                }
                None => {
                    submissions.insert(name.clone(), None);
                }
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let bonus = variant.responsible_bonus() * correct.len() as u32;
        if bonus > 0 {
            *deltas.entry(self.responsible.clone()).or_insert(0) += bonus;
        }

        Some(RoundOutcome { correct, deltas, submissions })
    }
}
