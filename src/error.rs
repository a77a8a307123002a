use thiserror::Error;

/// Everything a client request can be rejected with. Each variant maps to a
/// stable `kind` tag carried on the outbound `error` event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("session {0} was not found")]
    NotFound(String),
    #[error("only the host can do that")]
    NotHost,
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("you cannot answer your own round")]
    OwnRound,
    #[error("that action is not available in this game mode")]
    WrongVariant,
    #[error("the name \"{0}\" is already taken in this session")]
    NameTaken(String),
    #[error("display names must be between 1 and 50 characters")]
    InvalidName,
    #[error("the session is full")]
    SessionFull,
    #[error("the game has already started")]
    AlreadyInProgress,
    #[error("the game has not started yet")]
    NotStarted,
    #[error("at least {0} connected players are needed to start")]
    NotEnoughPlayers(usize),
    #[error("a round is already running")]
    RoundInProgress,
    #[error("there is no round to answer right now")]
    NoActiveRound,
    #[error("this round is already over")]
    RoundOver,
    #[error("you are not in a session")]
    NotInSession,
    #[error("you are already in a session")]
    AlreadyInSession,
    #[error("could not come up with a fresh question, try a different topic")]
    DuplicateContentExhausted,
}

impl GameError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotHost | Self::NotYourTurn | Self::OwnRound | Self::WrongVariant => "forbidden",
            Self::NameTaken(_)
            | Self::InvalidName
            | Self::SessionFull
            | Self::AlreadyInProgress
            | Self::NotStarted
            | Self::NotEnoughPlayers(_)
            | Self::RoundInProgress
            | Self::NoActiveRound
            | Self::RoundOver
            | Self::NotInSession
            | Self::AlreadyInSession => "conflict",
            Self::DuplicateContentExhausted => "duplicate_content",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(GameError::NotFound("ABC123".into()).kind(), "not_found");
        assert_eq!(GameError::NotHost.kind(), "forbidden");
        assert_eq!(GameError::OwnRound.kind(), "forbidden");
        assert_eq!(GameError::NameTaken("Ana".into()).kind(), "conflict");
        assert_eq!(GameError::SessionFull.kind(), "conflict");
        assert_eq!(GameError::DuplicateContentExhausted.kind(), "duplicate_content");
    }
}
