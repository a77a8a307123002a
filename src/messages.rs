use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::rules::GameVariant;
use crate::session::{Phase, Player};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "create_session")]
    CreateSession {
        host_name: String,
        #[serde(default)]
        variant: GameVariant,
        #[serde(default)]
        total_rounds: Option<u32>,
        #[serde(default)]
        score_target: Option<u32>,
    },
    #[serde(rename = "join_session")]
    JoinSession { code: String, player_name: String },
    #[serde(rename = "leave_session")]
    LeaveSession,
    #[serde(rename = "start_game")]
    StartGame,
    #[serde(rename = "reset_game")]
    ResetGame,
    #[serde(rename = "select_topic")]
    SelectTopic {
        #[serde(default)]
        topic: Option<String>,
    },
    #[serde(rename = "submit_answer")]
    SubmitAnswer { answer: String },
    #[serde(rename = "draw_update")]
    DrawUpdate { stroke: serde_json::Value },
    #[serde(rename = "clear_canvas")]
    ClearCanvas,
    #[serde(rename = "chat_message")]
    ChatMessage { text: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub score: u32,
    pub connected: bool,
}

impl From<&Player> for MemberInfo {
    fn from(player: &Player) -> Self {
        Self { name: player.name.clone(), score: player.score, connected: player.connected }
    }
}

/// Current-round view for joiners; the prompt is present only when the
/// recipient is the drawer, and trivia answers are never included.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoundSnapshot {
    pub number: u32,
    pub responsible: String,
    pub prompt: Option<String>,
    pub question: Option<String>,
    pub options: Option<Vec<String>>,
    pub deadline_secs: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session_created")]
    SessionCreated { code: String, host: String, members: Vec<MemberInfo> },
    #[serde(rename = "session_joined")]
    SessionJoined {
        code: String,
        variant: GameVariant,
        phase: Phase,
        host: String,
        you: String,
        members: Vec<MemberInfo>,
        round_number: u32,
        total_rounds: u32,
        /// Whose turn it currently is, once the game has started.
        responsible: Option<String>,
        round: Option<RoundSnapshot>,
    },
    #[serde(rename = "player_joined")]
    PlayerJoined { name: String, members: Vec<MemberInfo> },
    #[serde(rename = "player_left")]
    PlayerLeft { name: String, members: Vec<MemberInfo> },
    #[serde(rename = "game_started")]
    GameStarted {
        responsible: String,
        members: Vec<MemberInfo>,
        round_number: u32,
        total_rounds: u32,
    },
    #[serde(rename = "drawing_started")]
    DrawingStarted {
        round_number: u32,
        drawer: String,
        /// Sent only to the drawer; everyone else receives `null`.
        prompt: Option<String>,
        deadline_secs: u64,
    },
    #[serde(rename = "question_ready")]
    QuestionReady {
        round_number: u32,
        picker: String,
        question: String,
        options: Option<Vec<String>>,
        deadline_secs: u64,
    },
    #[serde(rename = "player_answered")]
    PlayerAnswered { name: String },
    #[serde(rename = "round_results")]
    RoundResults {
        round_number: u32,
        answer: String,
        explanation: Option<String>,
        /// Raw submissions per eligible player; `null` means no answer
        /// arrived before the deadline.
        submissions: HashMap<String, Option<String>>,
        correct_players: Vec<String>,
        next_responsible: Option<String>,
        members: Vec<MemberInfo>,
    },
    #[serde(rename = "game_ended")]
    GameEnded { final_scores: Vec<MemberInfo> },
    #[serde(rename = "game_paused")]
    GamePaused { reason: String },
    #[serde(rename = "game_resumed")]
    GameResumed { deadline_secs: Option<u64> },
    #[serde(rename = "session_reset")]
    SessionReset { members: Vec<MemberInfo> },
    #[serde(rename = "session_closed")]
    SessionClosed { reason: String },
    #[serde(rename = "draw_update")]
    DrawUpdate { stroke: serde_json::Value },
    #[serde(rename = "canvas_cleared")]
    CanvasCleared,
    #[serde(rename = "chat_update")]
    ChatUpdate { sender: String, text: String },
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_by_tag() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_session","code":"AB12CD","player_name":"Ana"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::JoinSession { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"create_session","host_name":"Ana"}"#).unwrap();
        match msg {
            ClientMessage::CreateSession { variant, total_rounds, .. } => {
                assert_eq!(variant, GameVariant::DrawGuess);
                assert_eq!(total_rounds, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_messages_carry_their_tag() {
        let text =
            serde_json::to_string(&ServerMessage::PlayerAnswered { name: "Ben".into() }).unwrap();
        assert!(text.contains(r#""type":"player_answered""#));

        let text = serde_json::to_string(&ServerMessage::Error {
            kind: "conflict".into(),
            message: "the session is full".into(),
        })
        .unwrap();
        assert!(text.contains(r#""kind":"conflict""#));
    }
}
