//! Process-wide code-to-session map. Lookups run concurrently; creation and
//! removal serialize on the map's write lock, and each session carries its
//! own mutex so work on different sessions never blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use crate::rules::GameVariant;
use crate::session::{Session, SessionSettings};

pub const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Sessions untouched for this long are deleted by the reaper.
pub const IDLE_WINDOW: Duration = Duration::from_secs(30 * 60);

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session under a code not currently in use. Collisions are
    /// checked under the write lock and retried, never assumed away.
    pub async fn create(
        &self,
        host_name: &str,
        host_conn: &str,
        variant: GameVariant,
        settings: SessionSettings,
    ) -> (String, SharedSession) {
        let mut sessions = self.sessions.write().await;
        let code = loop {
            let candidate = random_code();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(Mutex::new(Session::new(
            code.clone(),
            host_name,
            host_conn,
            variant,
            settings,
            Instant::now(),
        )));
        sessions.insert(code.clone(), Arc::clone(&session));
        (code, session)
    }

    pub async fn lookup(&self, code: &str) -> Option<SharedSession> {
        let code = code.trim().to_ascii_uppercase();
        self.sessions.read().await.get(&code).cloned()
    }

    pub async fn remove(&self, code: &str) -> bool {
        self.sessions.write().await.remove(code).is_some()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Delete sessions idle longer than `max_idle`; returns the reaped codes.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<String> {
        let snapshot: Vec<(String, SharedSession)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(code, s)| (code.clone(), Arc::clone(s))).collect()
        };

        let now = Instant::now();
        let mut stale = Vec::new();
        for (code, session) in snapshot {
            let guard = session.lock().await;
            if now.duration_since(guard.last_activity) >= max_idle {
                stale.push(code);
            }
        }

        if !stale.is_empty() {
            let mut sessions = self.sessions.write().await;
            for code in &stale {
                sessions.remove(code);
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SessionSettings {
        SessionSettings::for_variant(GameVariant::DrawGuess)
    }

    #[tokio::test]
    async fn codes_are_short_uppercase_alphanumeric() {
        let registry = SessionRegistry::new();
        for _ in 0..50 {
            let (code, _) =
                registry.create("Ana", "conn-0", GameVariant::DrawGuess, settings()).await;
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
        assert_eq!(registry.count().await, 50);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_and_trimmed() {
        let registry = SessionRegistry::new();
        let (code, _) = registry.create("Ana", "conn-0", GameVariant::DrawGuess, settings()).await;
        assert!(registry.lookup(&format!("  {} ", code.to_lowercase())).await.is_some());
        assert!(registry.lookup("NOPE42").await.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_the_session() {
        let registry = SessionRegistry::new();
        let (code, _) = registry.create("Ana", "conn-0", GameVariant::DrawGuess, settings()).await;
        assert!(registry.remove(&code).await);
        assert!(!registry.remove(&code).await);
        assert!(registry.lookup(&code).await.is_none());
    }

    #[tokio::test]
    async fn reaper_only_takes_idle_sessions() {
        let registry = SessionRegistry::new();
        let (old_code, old) =
            registry.create("Ana", "conn-0", GameVariant::DrawGuess, settings()).await;
        let (fresh_code, _) =
            registry.create("Ben", "conn-1", GameVariant::Trivia, settings()).await;

        if let Some(aged) = Instant::now().checked_sub(Duration::from_secs(2)) {
            old.lock().await.last_activity = aged;
        }

        let reaped = registry.reap_idle(Duration::from_secs(1)).await;
        assert_eq!(reaped, vec![old_code.clone()]);
        assert!(registry.lookup(&old_code).await.is_none());
        assert!(registry.lookup(&fresh_code).await.is_some());
    }
}
