//! Round content and the provider boundary. Providers are fallible and
//! possibly slow, so every fetch is bounded by a timeout and falls back to
//! deterministic builtin content rather than stalling a round.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::error::GameError;
use crate::rules::{normalize, GameVariant};

pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(3);
/// Generation attempts before giving up on finding unused content.
pub const CONTENT_RETRY_LIMIT: usize = 8;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content provider timed out")]
    Timeout,
    #[error("content provider failed: {0}")]
    Provider(String),
    #[error("content provider returned malformed content")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundContent {
    Prompt {
        word: String,
    },
    Question {
        question: String,
        answer: String,
        options: Option<Vec<String>>,
        explanation: Option<String>,
    },
}

impl RoundContent {
    pub fn answer(&self) -> &str {
        match self {
            Self::Prompt { word } => word,
            Self::Question { answer, .. } => answer,
        }
    }

    pub fn explanation(&self) -> Option<&str> {
        match self {
            Self::Prompt { .. } => None,
            Self::Question { explanation, .. } => explanation.as_deref(),
        }
    }

    /// Normalized identity used for duplicate detection within a session.
    pub fn key(&self) -> (String, String) {
        match self {
            Self::Prompt { word } => (normalize(word), normalize(word)),
            Self::Question { question, answer, .. } => (normalize(question), normalize(answer)),
        }
    }

    fn fits(&self, variant: GameVariant) -> bool {
        match (self, variant) {
            (Self::Prompt { word }, GameVariant::DrawGuess) => !word.trim().is_empty(),
            (Self::Question { question, answer, .. }, GameVariant::Trivia) => {
                !question.trim().is_empty() && !answer.trim().is_empty()
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn generate(
        &self,
        variant: GameVariant,
        topic: Option<&str>,
    ) -> Result<RoundContent, ContentError>;
}

const PROMPT_WORDS: &[&str] = &[
    "cat", "house", "tree", "car", "dog", "sun", "moon", "star", "flower", "boat", "apple",
    "pizza", "guitar", "bird", "fish", "mountain", "cloud", "chair", "hat", "rocket",
];

const QUESTION_BANK: &[(&str, &str, Option<&[&str]>, &str)] = &[
    (
        "How many sides does a hexagon have?",
        "6",
        Some(&["4", "5", "6", "8"]),
        "A hexagon has six sides and six corners.",
    ),
    (
        "What is the capital of France?",
        "Paris",
        None,
        "Paris has been the French capital since the 10th century.",
    ),
    (
        "Which planet is known as the Red Planet?",
        "Mars",
        Some(&["Venus", "Mars", "Jupiter", "Mercury"]),
        "Iron oxide on its surface gives Mars its reddish color.",
    ),
    (
        "How many continents are there on Earth?",
        "7",
        Some(&["5", "6", "7", "8"]),
        "Africa, Antarctica, Asia, Europe, North America, Oceania and South America.",
    ),
    (
        "What gas do plants absorb from the atmosphere?",
        "carbon dioxide",
        None,
        "Photosynthesis turns carbon dioxide and water into sugar and oxygen.",
    ),
    (
        "Who painted the Mona Lisa?",
        "Leonardo da Vinci",
        None,
        "Painted in the early 1500s, it now hangs in the Louvre.",
    ),
    (
        "What is the largest ocean on Earth?",
        "Pacific",
        Some(&["Atlantic", "Indian", "Arctic", "Pacific"]),
        "The Pacific covers about a third of the planet's surface.",
    ),
    (
        "How many minutes are in a full day?",
        "1440",
        None,
        "24 hours times 60 minutes.",
    ),
    (
        "What is the chemical symbol for gold?",
        "Au",
        Some(&["Ag", "Au", "Gd", "Go"]),
        "From the Latin aurum.",
    ),
    (
        "Which country is the birthplace of pizza?",
        "Italy",
        None,
        "Modern pizza comes from Naples.",
    ),
];

/// Offline provider drawing from a fixed word list and question bank. Topics
/// are accepted but not used to filter the picks.
#[derive(Default)]
pub struct BuiltinContent;

impl BuiltinContent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContentProvider for BuiltinContent {
    async fn generate(
        &self,
        variant: GameVariant,
        _topic: Option<&str>,
    ) -> Result<RoundContent, ContentError> {
        let mut rng = rand::thread_rng();
        match variant {
            GameVariant::DrawGuess => {
                let word = PROMPT_WORDS.choose(&mut rng).ok_or(ContentError::Malformed)?;
                Ok(RoundContent::Prompt { word: (*word).to_string() })
            }
            GameVariant::Trivia => {
                let (question, answer, options, explanation) =
                    QUESTION_BANK.choose(&mut rng).ok_or(ContentError::Malformed)?;
                Ok(RoundContent::Question {
                    question: (*question).to_string(),
                    answer: (*answer).to_string(),
                    options: options.map(|opts| opts.iter().map(|o| (*o).to_string()).collect()),
                    explanation: Some((*explanation).to_string()),
                })
            }
        }
    }
}

/// Deterministic stand-in used whenever the provider is unavailable.
pub fn fallback_content(variant: GameVariant, topic: Option<&str>) -> RoundContent {
    match variant {
        GameVariant::DrawGuess => RoundContent::Prompt { word: "a random object".to_string() },
        GameVariant::Trivia => {
            if let Some(first) = topic.and_then(|t| t.trim().chars().next()) {
                let topic = topic.unwrap_or_default().trim().to_string();
                RoundContent::Question {
                    question: format!("Which letter does the topic \"{topic}\" start with?"),
                    answer: first.to_uppercase().to_string(),
                    options: None,
                    explanation: Some(format!("\"{topic}\" starts with \"{first}\".")),
                }
            } else {
                RoundContent::Question {
                    question: "How many sides does a hexagon have?".to_string(),
                    answer: "6".to_string(),
                    options: Some(vec!["4".into(), "5".into(), "6".into(), "8".into()]),
                    explanation: Some("A hexagon has six sides and six corners.".to_string()),
                }
            }
        }
    }
}

/// One bounded provider call. Timeouts, provider errors and content of the
/// wrong shape all degrade to the deterministic fallback.
pub async fn fetch_or_fallback(
    provider: &dyn ContentProvider,
    variant: GameVariant,
    topic: Option<&str>,
) -> RoundContent {
    match tokio::time::timeout(PROVIDER_TIMEOUT, provider.generate(variant, topic)).await {
        Ok(Ok(content)) if content.fits(variant) => content,
        Ok(Ok(_)) => {
            warn!("content provider returned the wrong shape, using fallback");
            fallback_content(variant, topic)
        }
        Ok(Err(e)) => {
            warn!("content provider failed ({e}), using fallback");
            fallback_content(variant, topic)
        }
        Err(_) => {
            warn!("content provider timed out, using fallback");
            fallback_content(variant, topic)
        }
    }
}

/// Fetch content not yet used in this session, retrying a bounded number of
/// times. Trivia reports exhaustion so the picker can try another topic; for
/// drawing prompts a repeat is acceptable and the last candidate is kept.
pub async fn pick_fresh_content(
    provider: &dyn ContentProvider,
    variant: GameVariant,
    topic: Option<&str>,
    used: &HashSet<(String, String)>,
) -> Result<RoundContent, GameError> {
    let mut last = None;
    for _ in 0..CONTENT_RETRY_LIMIT {
        let content = fetch_or_fallback(provider, variant, topic).await;
        if !used.contains(&content.key()) {
            return Ok(content);
        }
        last = Some(content);
    }
    match (variant, last) {
        (GameVariant::DrawGuess, Some(content)) => Ok(content),
        _ => Err(GameError::DuplicateContentExhausted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StuckProvider;

    #[async_trait]
    impl ContentProvider for StuckProvider {
        async fn generate(
            &self,
            _variant: GameVariant,
            _topic: Option<&str>,
        ) -> Result<RoundContent, ContentError> {
            Err(ContentError::Provider("offline".into()))
        }
    }

    struct OneQuestionProvider;

    #[async_trait]
    impl ContentProvider for OneQuestionProvider {
        async fn generate(
            &self,
            _variant: GameVariant,
            _topic: Option<&str>,
        ) -> Result<RoundContent, ContentError> {
            Ok(RoundContent::Question {
                question: "What is the capital of France?".into(),
                answer: "Paris".into(),
                options: None,
                explanation: None,
            })
        }
    }

    #[tokio::test]
    async fn builtin_provider_matches_variant_shape() {
        let provider = BuiltinContent::new();
        let prompt = provider.generate(GameVariant::DrawGuess, None).await.unwrap();
        assert!(matches!(prompt, RoundContent::Prompt { .. }));
        let question = provider.generate(GameVariant::Trivia, Some("space")).await.unwrap();
        assert!(matches!(question, RoundContent::Question { .. }));
    }

    #[tokio::test]
    async fn provider_failure_falls_back_deterministically() {
        let used = HashSet::new();
        let content =
            pick_fresh_content(&StuckProvider, GameVariant::DrawGuess, None, &used).await.unwrap();
        assert_eq!(content, fallback_content(GameVariant::DrawGuess, None));
    }

    #[test]
    fn trivia_fallback_varies_by_topic() {
        let with_topic = fallback_content(GameVariant::Trivia, Some("rockets"));
        assert_eq!(with_topic.answer(), "R");
        let without = fallback_content(GameVariant::Trivia, None);
        assert_eq!(without.answer(), "6");
    }

    #[tokio::test]
    async fn repeated_question_exhausts_retries() {
        let mut used = HashSet::new();
        used.insert(
            RoundContent::Question {
                question: "What is the capital of France?".into(),
                answer: "Paris".into(),
                options: None,
                explanation: None,
            }
            .key(),
        );
        let err =
            pick_fresh_content(&OneQuestionProvider, GameVariant::Trivia, Some("geo"), &used)
                .await
                .unwrap_err();
        assert_eq!(err, GameError::DuplicateContentExhausted);
    }

    #[tokio::test]
    async fn repeated_prompt_is_tolerated() {
        let mut used = HashSet::new();
        used.insert(fallback_content(GameVariant::DrawGuess, None).key());
        let content =
            pick_fresh_content(&StuckProvider, GameVariant::DrawGuess, None, &used).await.unwrap();
        assert_eq!(content.answer(), "a random object");
    }

    #[test]
    fn keys_are_normalized() {
        let a = RoundContent::Question {
            question: "What is  the capital of France?".into(),
            answer: "Paris.".into(),
            options: None,
            explanation: None,
        };
        let b = RoundContent::Question {
            question: "what is the capital of france".into(),
            answer: "paris".into(),
            options: Some(vec!["Paris".into(), "Lyon".into()]),
            explanation: Some("different metadata, same identity".into()),
        };
        assert_eq!(a.key(), b.key());
    }
}
