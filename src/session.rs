//! The per-session state machine: membership, phase, turn rotation, round
//! lifecycle and scoring. All methods are synchronous; the caller serializes
//! access through the per-session lock owned by the registry.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::content::RoundContent;
use crate::error::GameError;
use crate::round::Round;
use crate::rules::GameVariant;

pub const MAX_PLAYERS: usize = 10;
pub const MIN_PLAYERS: usize = 2;
pub const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    InProgress,
    Paused,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub name: String,
    pub score: u32,
    pub connected: bool,
    /// Connection currently speaking for this player, if any.
    pub conn: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub total_rounds: u32,
    /// Optional early-termination threshold: first player at or past this
    /// score ends the game at the next resolution.
    pub score_target: Option<u32>,
    pub max_players: usize,
    pub min_players: usize,
    pub round_time: Duration,
}

impl SessionSettings {
    pub fn for_variant(variant: GameVariant) -> Self {
        Self {
            total_rounds: variant.default_rounds(),
            score_target: None,
            max_players: MAX_PLAYERS,
            min_players: MIN_PLAYERS,
            round_time: variant.round_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Joined,
    Rejoined,
}

#[derive(Debug)]
pub enum NextStep {
    Continue { responsible: String },
    Finished,
}

/// Everything a resolution needs to broadcast, captured while the session
/// lock is held so event order matches commit order.
#[derive(Debug)]
pub struct SessionResolution {
    pub number: u32,
    pub answer: String,
    pub explanation: Option<String>,
    pub submissions: std::collections::HashMap<String, Option<String>>,
    pub correct: Vec<String>,
    pub next: NextStep,
}

pub struct Session {
    pub code: String,
    pub host: String,
    pub variant: GameVariant,
    pub settings: SessionSettings,
    pub phase: Phase,
    /// Insertion order is turn order; names are unique within the session.
    pub players: Vec<Player>,
    pub turn_index: usize,
    pub round_number: u32,
    pub current_round: Option<Round>,
    pub used_content: HashSet<(String, String)>,
    pub last_activity: Instant,
    /// Bumped whenever outstanding scheduled work (deadline or intermission
    /// timers) must become inert: round start, resolution, pause, resume,
    /// reset. Scheduled tasks capture the value and no-op on mismatch.
    timer_epoch: u64,
    round_seq: u64,
}

pub fn validate_name(raw: &str) -> Result<String, GameError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(GameError::InvalidName);
    }
    Ok(name.to_string())
}

impl Session {
    pub fn new(
        code: String,
        host_name: &str,
        host_conn: &str,
        variant: GameVariant,
        settings: SessionSettings,
        now: Instant,
    ) -> Self {
        Self {
            code,
            host: host_name.to_string(),
            variant,
            settings,
            phase: Phase::Waiting,
            players: vec![Player {
                name: host_name.to_string(),
                score: 0,
                connected: true,
                conn: Some(host_conn.to_string()),
            }],
            turn_index: 0,
            round_number: 0,
            current_round: None,
            used_content: HashSet::new(),
            last_activity: now,
            timer_epoch: 0,
            round_seq: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn epoch(&self) -> u64 {
        self.timer_epoch
    }

    pub fn player(&self, name: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.name == name)
    }

    pub fn connected_count(&self) -> usize {
        self.players.iter().filter(|p| p.connected).count()
    }

    /// The member currently holding round duty, once the game has started.
    pub fn responsible(&self) -> Option<&str> {
        if self.phase == Phase::Waiting {
            return None;
        }
        self.players.get(self.turn_index).map(|p| p.name.as_str())
    }

    pub fn round_active(&self) -> bool {
        self.current_round.as_ref().is_some_and(|r| !r.resolved)
    }

    pub fn join(&mut self, name: &str, conn: &str, now: Instant) -> Result<JoinKind, GameError> {
        self.touch(now);
        if let Some(player) = self.players.iter_mut().find(|p| p.name == name) {
            if player.connected {
                return Err(GameError::NameTaken(name.to_string()));
            }
            player.connected = true;
            player.conn = Some(conn.to_string());
            return Ok(JoinKind::Rejoined);
        }
        if self.phase != Phase::Waiting {
            return Err(GameError::AlreadyInProgress);
        }
        if self.players.len() >= self.settings.max_players {
            return Err(GameError::SessionFull);
        }
        self.players.push(Player {
            name: name.to_string(),
            score: 0,
            connected: true,
            conn: Some(conn.to_string()),
        });
        Ok(JoinKind::Joined)
    }

    /// Waiting-phase departure: the player is actually removed.
    pub fn remove_player(&mut self, name: &str) {
        self.players.retain(|p| p.name != name);
    }

    /// Mid-game departure: the player stays on the roster but stops counting
    /// for turn rotation and outstanding answers.
    pub fn mark_disconnected(&mut self, name: &str) {
        if let Some(player) = self.players.iter_mut().find(|p| p.name == name) {
            player.connected = false;
            player.conn = None;
        }
    }

    pub fn start(&mut self, requester: &str, now: Instant) -> Result<&str, GameError> {
        self.touch(now);
        if requester != self.host {
            return Err(GameError::NotHost);
        }
        if self.phase != Phase::Waiting {
            return Err(GameError::AlreadyInProgress);
        }
        if self.connected_count() < self.settings.min_players {
            return Err(GameError::NotEnoughPlayers(self.settings.min_players));
        }
        self.phase = Phase::InProgress;
        self.round_number = 1;
        let connected: Vec<usize> = self
            .players
            .iter()
            .enumerate()
            .filter(|(_, p)| p.connected)
            .map(|(i, _)| i)
            .collect();
        self.turn_index = connected.choose(&mut rand::thread_rng()).copied().unwrap_or(0);
        Ok(&self.players[self.turn_index].name)
    }

    /// Open a new round for the current responsible member. Supersedes any
    /// previous round and invalidates outstanding timers.
    pub fn begin_round(&mut self, content: RoundContent, now: Instant) -> &Round {
        self.touch(now);
        self.round_seq += 1;
        self.timer_epoch += 1;
        self.used_content.insert(content.key());
        let responsible = self.players[self.turn_index].name.clone();
        let round = Round::new(
            self.round_seq,
            self.round_number,
            content,
            responsible,
            now,
            self.settings.round_time,
        );
        self.current_round.insert(round)
    }

    pub fn record_submission(
        &mut self,
        name: &str,
        text: String,
        now: Instant,
    ) -> Result<(), GameError> {
        self.touch(now);
        if self.phase != Phase::InProgress {
            return Err(GameError::NotStarted);
        }
        let Some(round) = self.current_round.as_mut() else {
            return Err(GameError::NoActiveRound);
        };
        if round.resolved {
            return Err(GameError::RoundOver);
        }
        if round.responsible == name {
            return Err(GameError::OwnRound);
        }
        round.record(name, text, now);
        Ok(())
    }

    /// True once every connected, eligible member has an answer on file for
    /// the active round.
    pub fn all_answered(&self) -> bool {
        let Some(round) = self.current_round.as_ref().filter(|r| !r.resolved) else {
            return false;
        };
        self.players
            .iter()
            .filter(|p| p.connected && p.name != round.responsible)
            .all(|p| round.submissions.contains_key(&p.name))
    }

    /// Resolve the active round, apply scores, and advance the state
    /// machine. Returns `None` when there is nothing (left) to resolve.
    pub fn resolve_round(&mut self, now: Instant) -> Option<SessionResolution> {
        if self.phase != Phase::InProgress {
            return None;
        }
        self.touch(now);
        let responsible = self.current_round.as_ref()?.responsible.clone();
        let eligible: Vec<String> = self
            .players
            .iter()
            .filter(|p| p.connected && p.name != responsible)
            .map(|p| p.name.clone())
            .collect();

        let variant = self.variant;
        let round = self.current_round.as_mut()?;
        let outcome = round.resolve(variant, &eligible)?;
        let number = round.number;
        let answer = round.answer().to_string();
        let explanation = round.content.explanation().map(str::to_string);
        self.timer_epoch += 1;

        for (name, delta) in &outcome.deltas {
            if let Some(player) = self.players.iter_mut().find(|p| &p.name == name) {
                player.score = player.score.saturating_add(*delta);
            }
        }

        self.round_number += 1;
        let finished = self.round_number > self.settings.total_rounds || self.score_target_hit();
        let next = if finished {
            self.phase = Phase::Completed;
            NextStep::Finished
        } else {
            self.advance_turn();
            NextStep::Continue { responsible: self.players[self.turn_index].name.clone() }
        };

        Some(SessionResolution {
            number,
            answer,
            explanation,
            submissions: outcome.submissions,
            correct: outcome.correct,
            next,
        })
    }

    fn score_target_hit(&self) -> bool {
        self.settings
            .score_target
            .is_some_and(|target| self.players.iter().any(|p| p.score >= target))
    }

    /// If the member holding duty dropped before their round began, pass it
    /// on to the next connected member.
    pub fn skip_disconnected_responsible(&mut self) {
        if !self.players[self.turn_index].connected {
            self.advance_turn();
        }
    }

    /// Move duty to the next connected member in insertion order, wrapping.
    /// Leaves the index alone when nobody is connected.
    pub fn advance_turn(&mut self) {
        let len = self.players.len();
        for step in 1..=len {
            let idx = (self.turn_index + step) % len;
            if self.players[idx].connected {
                self.turn_index = idx;
                return;
            }
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if self.phase != Phase::InProgress {
            return;
        }
        self.phase = Phase::Paused;
        self.timer_epoch += 1;
        if let Some(round) = self.current_round.as_mut().filter(|r| !r.resolved) {
            round.pause(now);
        }
    }

    /// Back to `InProgress`; returns the re-armed round clock if a round was
    /// outstanding when the session paused.
    pub fn resume(&mut self, now: Instant) -> Option<Duration> {
        if self.phase != Phase::Paused {
            return None;
        }
        self.phase = Phase::InProgress;
        self.timer_epoch += 1;
        self.current_round.as_mut().filter(|r| !r.resolved).and_then(|r| r.resume(now))
    }

    /// Host-only: back to a fresh waiting room, keeping the roster.
    pub fn reset(&mut self, requester: &str, now: Instant) -> Result<(), GameError> {
        self.touch(now);
        if requester != self.host {
            return Err(GameError::NotHost);
        }
        self.phase = Phase::Waiting;
        self.round_number = 0;
        self.turn_index = 0;
        self.current_round = None;
        self.used_content.clear();
        self.timer_epoch += 1;
        for player in &mut self.players {
            player.score = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::TRIVIA_POINTS;

    fn draw_session(names: &[&str]) -> Session {
        let now = Instant::now();
        let mut session = Session::new(
            "AB12CD".into(),
            names[0],
            "conn-0",
            GameVariant::DrawGuess,
            SessionSettings::for_variant(GameVariant::DrawGuess),
            now,
        );
        for (i, name) in names.iter().enumerate().skip(1) {
            session.join(name, &format!("conn-{i}"), now).unwrap();
        }
        session
    }

    fn begin_prompt(session: &mut Session, word: &str, now: Instant) {
        session.begin_round(RoundContent::Prompt { word: word.into() }, now);
    }

    #[test]
    fn join_rules_enforced() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben"]);

        assert_eq!(session.join("Ana", "conn-9", now), Err(GameError::NameTaken("Ana".into())));

        session.start("Ana", now).unwrap();
        assert_eq!(session.join("Cleo", "conn-9", now), Err(GameError::AlreadyInProgress));

        // A known name that dropped can always come back, mid-game included.
        session.mark_disconnected("Ben");
        assert_eq!(session.join("Ben", "conn-10", now), Ok(JoinKind::Rejoined));
        assert!(session.player("Ben").unwrap().connected);
    }

    #[test]
    fn session_capacity_is_bounded() {
        let now = Instant::now();
        let mut session = draw_session(&["P0"]);
        for i in 1..MAX_PLAYERS {
            session.join(&format!("P{i}"), &format!("conn-{i}"), now).unwrap();
        }
        assert_eq!(session.join("Extra", "conn-x", now), Err(GameError::SessionFull));
    }

    #[test]
    fn start_requires_host_and_quorum() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben"]);
        assert_eq!(session.start("Ben", now).unwrap_err(), GameError::NotHost);

        session.mark_disconnected("Ben");
        assert_eq!(session.start("Ana", now).unwrap_err(), GameError::NotEnoughPlayers(2));

        session.join("Ben", "conn-1", now).unwrap();
        let responsible = session.start("Ana", now).unwrap().to_string();
        assert!(["Ana", "Ben"].contains(&responsible.as_str()));
        assert_eq!(session.phase, Phase::InProgress);
        assert_eq!(session.round_number, 1);
        assert_eq!(session.start("Ana", now).unwrap_err(), GameError::AlreadyInProgress);
    }

    #[test]
    fn rotation_visits_connected_members_in_order() {
        let mut session = draw_session(&["A", "B", "C", "D"]);
        session.phase = Phase::InProgress;
        session.turn_index = 0;

        session.mark_disconnected("C");
        let mut seen = Vec::new();
        for _ in 0..6 {
            session.advance_turn();
            seen.push(session.players[session.turn_index].name.clone());
        }
        assert_eq!(seen, ["B", "D", "A", "B", "D", "A"]);
    }

    #[test]
    fn scores_only_ever_grow() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben", "Cleo"]);
        session.start("Ana", now).unwrap();
        session.turn_index = 0; // Ana draws

        begin_prompt(&mut session, "rocket", now);
        session.record_submission("Ben", "rocket".into(), now).unwrap();
        session.record_submission("Cleo", "boat".into(), now).unwrap();
        session.resolve_round(now).unwrap();

        let after_first: Vec<u32> = session.players.iter().map(|p| p.score).collect();
        assert_eq!(after_first, [25, 100, 0]); // drawer bonus, fast guess, miss

        begin_prompt(&mut session, "cloud", now);
        session.record_submission("Cleo", "cloud".into(), now).unwrap();
        session.resolve_round(now).unwrap();
        for (before, player) in after_first.iter().zip(&session.players) {
            assert!(player.score >= *before);
        }
    }

    #[test]
    fn all_answered_skips_disconnected_and_responsible() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben", "Cleo"]);
        session.start("Ana", now).unwrap();
        session.turn_index = 0;
        begin_prompt(&mut session, "rocket", now);

        assert!(!session.all_answered());
        session.record_submission("Ben", "rocket".into(), now).unwrap();
        assert!(!session.all_answered());

        session.mark_disconnected("Cleo");
        assert!(session.all_answered());
    }

    #[test]
    fn responsible_member_cannot_answer() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben"]);
        session.start("Ana", now).unwrap();
        session.turn_index = 0;
        begin_prompt(&mut session, "rocket", now);

        assert_eq!(
            session.record_submission("Ana", "rocket".into(), now),
            Err(GameError::OwnRound)
        );
    }

    #[test]
    fn resolution_is_idempotent_and_advances_turn() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben", "Cleo"]);
        session.start("Ana", now).unwrap();
        session.turn_index = 0;
        begin_prompt(&mut session, "rocket", now);
        session.record_submission("Ben", "rocket".into(), now).unwrap();

        let resolution = session.resolve_round(now).unwrap();
        assert_eq!(resolution.correct, vec!["Ben".to_string()]);
        match resolution.next {
            NextStep::Continue { ref responsible } => assert_eq!(responsible, "Ben"),
            NextStep::Finished => panic!("game should continue"),
        }
        assert_eq!(session.round_number, 2);

        let scores: Vec<u32> = session.players.iter().map(|p| p.score).collect();
        assert!(session.resolve_round(now).is_none());
        assert_eq!(scores, session.players.iter().map(|p| p.score).collect::<Vec<_>>());
    }

    #[test]
    fn fixed_round_count_completes_the_game() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben"]);
        session.settings.total_rounds = 2;
        session.start("Ana", now).unwrap();

        begin_prompt(&mut session, "rocket", now);
        assert!(matches!(session.resolve_round(now).unwrap().next, NextStep::Continue { .. }));
        begin_prompt(&mut session, "cloud", now);
        assert!(matches!(session.resolve_round(now).unwrap().next, NextStep::Finished));
        assert_eq!(session.phase, Phase::Completed);
        assert!(session.resolve_round(now).is_none());
    }

    #[test]
    fn score_target_ends_the_game_early() {
        let now = Instant::now();
        let mut session = Session::new(
            "AB12CD".into(),
            "Ana",
            "conn-0",
            GameVariant::Trivia,
            SessionSettings::for_variant(GameVariant::Trivia),
            now,
        );
        session.join("Ben", "conn-1", now).unwrap();
        session.settings.score_target = Some(TRIVIA_POINTS);
        session.start("Ana", now).unwrap();
        session.turn_index = 0; // Ana picks, Ben answers

        session.begin_round(
            RoundContent::Question {
                question: "What is the capital of France?".into(),
                answer: "Paris".into(),
                options: None,
                explanation: None,
            },
            now,
        );
        session.record_submission("Ben", "paris.".into(), now).unwrap();
        let resolution = session.resolve_round(now).unwrap();
        assert!(matches!(resolution.next, NextStep::Finished));
        assert_eq!(session.player("Ben").unwrap().score, TRIVIA_POINTS);
    }

    #[test]
    fn pause_resume_preserves_round_and_invalidates_timers() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben"]);
        session.start("Ana", now).unwrap();
        begin_prompt(&mut session, "rocket", now);
        let round_epoch = session.epoch();

        session.mark_disconnected("Ana");
        session.mark_disconnected("Ben");
        assert_eq!(session.connected_count(), 0);
        session.pause(now + Duration::from_secs(10));
        assert_eq!(session.phase, Phase::Paused);
        assert_ne!(session.epoch(), round_epoch);

        // Paused sessions never resolve on a stale deadline.
        assert!(session.resolve_round(now + Duration::from_secs(120)).is_none());

        session.join("Ben", "conn-9", now).unwrap();
        let remaining = session.resume(now + Duration::from_secs(200)).unwrap();
        assert_eq!(session.phase, Phase::InProgress);
        assert_eq!(remaining, Duration::from_secs(50));
        assert_eq!(session.round_number, 1);
    }

    #[test]
    fn reset_keeps_roster_and_clears_progress() {
        let now = Instant::now();
        let mut session = draw_session(&["Ana", "Ben"]);
        session.start("Ana", now).unwrap();
        begin_prompt(&mut session, "rocket", now);
        session.record_submission("Ben", "rocket".into(), now).unwrap();
        session.resolve_round(now).unwrap();

        assert_eq!(session.reset("Ben", now).unwrap_err(), GameError::NotHost);
        session.reset("Ana", now).unwrap();
        assert_eq!(session.phase, Phase::Waiting);
        assert_eq!(session.round_number, 0);
        assert!(session.current_round.is_none());
        assert!(session.used_content.is_empty());
        assert_eq!(session.players.len(), 2);
        assert!(session.players.iter().all(|p| p.score == 0));
    }

    #[test]
    fn name_validation() {
        assert_eq!(validate_name("  Ana  ").unwrap(), "Ana");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
