//! Per-variant game rules: round timing, correctness checks and score
//! formulas. Both variants share the same session machinery and differ only
//! through the methods here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Points a correct guess is always worth in the drawing game.
pub const BASE_GUESS_POINTS: u32 = 50;
/// Extra points for a fast guess, scaled linearly down to zero at the deadline.
pub const SPEED_BONUS_MAX: u32 = 50;
/// Credited to the drawer for every correct guess on their drawing.
pub const DRAWER_BONUS: u32 = 25;
/// Flat award for a correct trivia answer.
pub const TRIVIA_POINTS: u32 = 100;
/// Similarity ratio at or above which a trivia answer counts as correct.
pub const MATCH_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GameVariant {
    #[serde(rename = "draw_guess")]
    #[default]
    DrawGuess,
    #[serde(rename = "trivia")]
    Trivia,
}

impl GameVariant {
    pub fn round_duration(self) -> Duration {
        match self {
            Self::DrawGuess => Duration::from_secs(60),
            Self::Trivia => Duration::from_secs(30),
        }
    }

    pub fn default_rounds(self) -> u32 {
        match self {
            Self::DrawGuess => 5,
            Self::Trivia => 10,
        }
    }

    /// Whether `submitted` counts as matching the authoritative `answer`.
    pub fn is_correct(self, submitted: &str, answer: &str) -> bool {
        match self {
            Self::DrawGuess => submitted.trim().eq_ignore_ascii_case(answer.trim()),
            Self::Trivia => is_close_enough(submitted, answer),
        }
    }

    /// Points awarded to a correct answerer who submitted `elapsed` into a
    /// round `window` long. Timing comes from the submission timestamp, not
    /// from whenever resolution happened to run.
    pub fn answer_points(self, elapsed: Duration, window: Duration) -> u32 {
        match self {
            Self::DrawGuess => {
                let left = window.saturating_sub(elapsed);
                let fraction = if window.is_zero() {
                    0.0
                } else {
                    left.as_secs_f64() / window.as_secs_f64()
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let bonus = (fraction * f64::from(SPEED_BONUS_MAX)).round() as u32;
                BASE_GUESS_POINTS + bonus.min(SPEED_BONUS_MAX)
            }
            Self::Trivia => TRIVIA_POINTS,
        }
    }

    /// Points the responsible member earns per correct submission.
    pub fn responsible_bonus(self) -> u32 {
        match self {
            Self::DrawGuess => DRAWER_BONUS,
            Self::Trivia => 0,
        }
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                cleaned.push(lower);
            }
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fuzzy acceptance for trivia answers: numeric answers compare numerically,
/// everything else by normalized edit-distance similarity.
pub fn is_close_enough(submitted: &str, answer: &str) -> bool {
    if let (Ok(a), Ok(b)) = (submitted.trim().parse::<f64>(), answer.trim().parse::<f64>()) {
        return (a - b).abs() < 1e-9;
    }
    let submitted = normalize(submitted);
    let answer = normalize(answer);
    if submitted.is_empty() || answer.is_empty() {
        return submitted == answer;
    }
    similarity(&submitted, &answer) >= MATCH_THRESHOLD
}

/// Similarity ratio in [0, 1]: 1.0 for identical strings, 0.0 for strings
/// with nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = 1.0 - levenshtein(a, b) as f64 / longest as f64;
    ratio
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
