use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::content::{pick_fresh_content, ContentProvider, RoundContent};
use crate::error::GameError;
use crate::messages::{ClientMessage, MemberInfo, RoundSnapshot, ServerMessage};
use crate::registry::{SessionRegistry, SharedSession, IDLE_WINDOW};
use crate::rules::GameVariant;
use crate::session::{validate_name, JoinKind, NextStep, Phase, Session, SessionSettings};

/// Breather between a round's results and the next drawing round.
pub const NEXT_ROUND_DELAY: Duration = Duration::from_secs(5);
const REAP_INTERVAL: Duration = Duration::from_secs(60);

struct ClientCtx {
    tx: mpsc::UnboundedSender<Message>,
    /// Set once the connection has created or joined a session: (code, name).
    binding: Option<(String, String)>,
}

type Connections = Arc<RwLock<HashMap<String, ClientCtx>>>;

#[derive(Clone)]
pub struct Server {
    registry: Arc<SessionRegistry>,
    connections: Connections,
    provider: Arc<dyn ContentProvider>,
}

fn member_infos(session: &Session) -> Vec<MemberInfo> {
    session.players.iter().map(MemberInfo::from).collect()
}

impl Server {
    pub fn new(provider: Arc<dyn ContentProvider>) -> Self {
        Server {
            registry: Arc::new(SessionRegistry::new()),
            connections: Arc::new(RwLock::new(HashMap::new())),
            provider,
        }
    }

    /// Periodically drop sessions idle past the window.
    pub fn spawn_idle_reaper(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                for code in server.registry.reap_idle(IDLE_WINDOW).await {
                    info!("reaped idle session {code}");
                }
            }
        });
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let conn_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(conn_id.clone(), ClientCtx { tx, binding: None });
        }
        debug!("connection {conn_id} opened");

        let server = self.clone();
        let reader_conn = conn_id.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(msg) => {
                        let Ok(text) = msg.to_str() else { continue };
                        match serde_json::from_str::<ClientMessage>(text) {
                            Ok(client_msg) => {
                                server.handle_client_message(&reader_conn, client_msg).await;
                            }
                            Err(e) => {
                                debug!("unparseable message on {reader_conn}: {e}");
                                server
                                    .send_to_conn(
                                        &reader_conn,
                                        &ServerMessage::Error {
                                            kind: "bad_request".into(),
                                            message: "unrecognized message".into(),
                                        },
                                    )
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("websocket error on {reader_conn}: {e}");
                        break;
                    }
                }
            }
            server.handle_disconnect(&reader_conn).await;
        });

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("failed to push to socket: {e}");
                    break;
                }
            }
        });
    }

    async fn handle_client_message(&self, conn_id: &str, message: ClientMessage) {
        let result = match message {
            ClientMessage::CreateSession { host_name, variant, total_rounds, score_target } => {
                self.create_session(conn_id, &host_name, variant, total_rounds, score_target).await
            }
            ClientMessage::JoinSession { code, player_name } => {
                self.join_session(conn_id, &code, &player_name).await
            }
            ClientMessage::LeaveSession => self.leave_session(conn_id).await,
            ClientMessage::StartGame => self.start_game(conn_id).await,
            ClientMessage::ResetGame => self.reset_game(conn_id).await,
            ClientMessage::SelectTopic { topic } => {
                self.select_topic(conn_id, topic.as_deref()).await
            }
            ClientMessage::SubmitAnswer { answer } => self.submit_answer(conn_id, answer).await,
            ClientMessage::DrawUpdate { stroke } => self.relay_draw(conn_id, stroke).await,
            ClientMessage::ClearCanvas => self.relay_clear(conn_id).await,
            ClientMessage::ChatMessage { text } => self.relay_chat(conn_id, text).await,
        };
        if let Err(err) = result {
            self.send_to_conn(
                conn_id,
                &ServerMessage::Error { kind: err.kind().into(), message: err.to_string() },
            )
            .await;
        }
    }

    async fn create_session(
        &self,
        conn_id: &str,
        host_name: &str,
        variant: GameVariant,
        total_rounds: Option<u32>,
        score_target: Option<u32>,
    ) -> Result<(), GameError> {
        if self.binding_of(conn_id).await.is_some() {
            return Err(GameError::AlreadyInSession);
        }
        let name = validate_name(host_name)?;
        let mut settings = SessionSettings::for_variant(variant);
        if let Some(rounds) = total_rounds {
            settings.total_rounds = rounds.clamp(1, 50);
        }
        settings.score_target = score_target;

        let (code, session) = self.registry.create(&name, conn_id, variant, settings).await;
        self.bind(conn_id, &code, &name).await;
        let guard = session.lock().await;
        info!("session {code} created by {name} ({variant:?})");
        self.send_to_conn(
            conn_id,
            &ServerMessage::SessionCreated {
                code: code.clone(),
                host: name,
                members: member_infos(&guard),
            },
        )
        .await;
        Ok(())
    }

    async fn join_session(
        &self,
        conn_id: &str,
        code: &str,
        player_name: &str,
    ) -> Result<(), GameError> {
        if self.binding_of(conn_id).await.is_some() {
            return Err(GameError::AlreadyInSession);
        }
        let name = validate_name(player_name)?;
        let session = self
            .registry
            .lookup(code)
            .await
            .ok_or_else(|| GameError::NotFound(code.trim().to_ascii_uppercase()))?;
        let mut guard = session.lock().await;
        let kind = guard.join(&name, conn_id, Instant::now())?;
        self.bind(conn_id, &guard.code, &name).await;
        match kind {
            JoinKind::Joined => info!("{name} joined session {}", guard.code),
            JoinKind::Rejoined => info!("{name} reconnected to session {}", guard.code),
        }

        if guard.phase == Phase::Paused {
            let now = Instant::now();
            let remaining = guard.resume(now);
            if let Some(remaining) = remaining {
                self.schedule_deadline(guard.code.clone(), guard.epoch(), now + remaining);
            } else if guard.variant == GameVariant::DrawGuess && !guard.round_active() {
                // The pause interrupted an intermission; pick the clock back up.
                self.schedule_next_round(guard.code.clone(), guard.epoch());
            }
            self.broadcast(
                &guard,
                &ServerMessage::GameResumed { deadline_secs: remaining.map(|r| r.as_secs()) },
            )
            .await;
            info!("session {} resumed", guard.code);
        }

        self.send_to_conn(conn_id, &snapshot_message(&guard, &name)).await;
        self.broadcast_except(
            &guard,
            &ServerMessage::PlayerJoined { name, members: member_infos(&guard) },
            Some(conn_id),
        )
        .await;
        Ok(())
    }

    async fn leave_session(&self, conn_id: &str) -> Result<(), GameError> {
        let (session, code, name) = self.bound_session(conn_id).await?;
        self.unbind(conn_id).await;
        let mut guard = session.lock().await;
        self.depart(&mut guard, &code, &name).await;
        Ok(())
    }

    async fn start_game(&self, conn_id: &str) -> Result<(), GameError> {
        let (session, code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        let responsible = guard.start(&name, Instant::now())?.to_string();
        info!("session {code} started, {responsible} is up first");
        self.broadcast(
            &guard,
            &ServerMessage::GameStarted {
                responsible,
                members: member_infos(&guard),
                round_number: guard.round_number,
                total_rounds: guard.settings.total_rounds,
            },
        )
        .await;
        if guard.variant == GameVariant::DrawGuess {
            self.begin_round(&mut guard, &code, None).await?;
        }
        // Trivia waits for the responsible member to pick a topic.
        Ok(())
    }

    async fn reset_game(&self, conn_id: &str) -> Result<(), GameError> {
        let (session, code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        guard.reset(&name, Instant::now())?;
        info!("session {code} reset by {name}");
        self.broadcast(&guard, &ServerMessage::SessionReset { members: member_infos(&guard) })
            .await;
        Ok(())
    }

    async fn select_topic(&self, conn_id: &str, topic: Option<&str>) -> Result<(), GameError> {
        let (session, code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        guard.touch(Instant::now());
        if guard.variant != GameVariant::Trivia {
            return Err(GameError::WrongVariant);
        }
        if guard.phase != Phase::InProgress {
            return Err(GameError::NotStarted);
        }
        if guard.round_active() {
            return Err(GameError::RoundInProgress);
        }
        if guard.responsible() != Some(name.as_str()) {
            return Err(GameError::NotYourTurn);
        }
        self.begin_round(&mut guard, &code, topic).await
    }

    async fn submit_answer(&self, conn_id: &str, answer: String) -> Result<(), GameError> {
        let (session, code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        guard.record_submission(&name, answer, Instant::now())?;
        self.broadcast(&guard, &ServerMessage::PlayerAnswered { name }).await;
        if guard.all_answered() {
            self.finish_round(&mut guard, &code).await;
        }
        Ok(())
    }

    async fn relay_draw(&self, conn_id: &str, stroke: serde_json::Value) -> Result<(), GameError> {
        let (session, _code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        guard.touch(Instant::now());
        if guard.variant != GameVariant::DrawGuess {
            return Err(GameError::WrongVariant);
        }
        if guard.phase != Phase::InProgress || !guard.round_active() {
            return Err(GameError::NoActiveRound);
        }
        if guard.responsible() != Some(name.as_str()) {
            return Err(GameError::NotYourTurn);
        }
        self.broadcast_except(&guard, &ServerMessage::DrawUpdate { stroke }, Some(conn_id)).await;
        Ok(())
    }

    async fn relay_clear(&self, conn_id: &str) -> Result<(), GameError> {
        let (session, _code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        guard.touch(Instant::now());
        if guard.variant != GameVariant::DrawGuess {
            return Err(GameError::WrongVariant);
        }
        if guard.responsible() != Some(name.as_str()) {
            return Err(GameError::NotYourTurn);
        }
        self.broadcast_except(&guard, &ServerMessage::CanvasCleared, Some(conn_id)).await;
        Ok(())
    }

    async fn relay_chat(&self, conn_id: &str, text: String) -> Result<(), GameError> {
        let (session, _code, name) = self.bound_session(conn_id).await?;
        let mut guard = session.lock().await;
        guard.touch(Instant::now());
        self.broadcast(&guard, &ServerMessage::ChatUpdate { sender: name, text }).await;
        Ok(())
    }

    /// Fetch fresh content, open the round, tell everyone, arm the deadline.
    /// Called with the session lock held.
    async fn begin_round(
        &self,
        guard: &mut Session,
        code: &str,
        topic: Option<&str>,
    ) -> Result<(), GameError> {
        let content =
            pick_fresh_content(self.provider.as_ref(), guard.variant, topic, &guard.used_content)
                .await?;
        let now = Instant::now();
        let (number, responsible, deadline, content) = {
            let round = guard.begin_round(content, now);
            (round.number, round.responsible.clone(), round.deadline, round.content.clone())
        };
        let deadline_secs = guard.settings.round_time.as_secs();
        info!("session {code} round {number} started, {responsible} is responsible");

        match &content {
            RoundContent::Prompt { word } => {
                // The drawer is the only one who gets to see the word.
                let masked = ServerMessage::DrawingStarted {
                    round_number: number,
                    drawer: responsible.clone(),
                    prompt: None,
                    deadline_secs,
                };
                let drawer_conn = guard.player(&responsible).and_then(|p| p.conn.clone());
                if let Some(drawer_conn) = drawer_conn {
                    self.send_to_conn(
                        &drawer_conn,
                        &ServerMessage::DrawingStarted {
                            round_number: number,
                            drawer: responsible.clone(),
                            prompt: Some(word.clone()),
                            deadline_secs,
                        },
                    )
                    .await;
                    self.broadcast_except(guard, &masked, Some(&drawer_conn)).await;
                } else {
                    self.broadcast(guard, &masked).await;
                }
            }
            RoundContent::Question { question, options, .. } => {
                self.broadcast(
                    guard,
                    &ServerMessage::QuestionReady {
                        round_number: number,
                        picker: responsible.clone(),
                        question: question.clone(),
                        options: options.clone(),
                        deadline_secs,
                    },
                )
                .await;
            }
        }

        self.schedule_deadline(code.to_string(), guard.epoch(), deadline);
        Ok(())
    }

    /// Resolve the active round and broadcast the results; schedules the next
    /// drawing round or hands the floor to the next topic-picker.
    async fn finish_round(&self, guard: &mut Session, code: &str) {
        let Some(resolution) = guard.resolve_round(Instant::now()) else {
            return;
        };
        let next_responsible = match &resolution.next {
            NextStep::Continue { responsible } => Some(responsible.clone()),
            NextStep::Finished => None,
        };
        info!(
            "session {code} round {} resolved, {} correct",
            resolution.number,
            resolution.correct.len()
        );
        self.broadcast(
            guard,
            &ServerMessage::RoundResults {
                round_number: resolution.number,
                answer: resolution.answer,
                explanation: resolution.explanation,
                submissions: resolution.submissions,
                correct_players: resolution.correct,
                next_responsible,
                members: member_infos(guard),
            },
        )
        .await;

        match resolution.next {
            NextStep::Finished => {
                info!("session {code} completed");
                self.broadcast(
                    guard,
                    &ServerMessage::GameEnded { final_scores: member_infos(guard) },
                )
                .await;
            }
            NextStep::Continue { .. } => {
                if guard.variant == GameVariant::DrawGuess {
                    self.schedule_next_round(code.to_string(), guard.epoch());
                }
            }
        }
    }

    /// One-shot deadline alarm. No-ops unless the captured epoch still
    /// matches, so early resolution, pauses and resets make it inert.
    fn schedule_deadline(&self, code: String, epoch: u64, deadline: Instant) {
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            let Some(session) = server.registry.lookup(&code).await else {
                return;
            };
            let mut guard = session.lock().await;
            if guard.epoch() != epoch {
                return;
            }
            debug!("session {code}: deadline reached");
            server.finish_round(&mut guard, &code).await;
        });
    }

    /// Start the next drawing round after the intermission, unless the
    /// session moved on (pause, reset, completion) in the meantime.
    fn schedule_next_round(&self, code: String, epoch: u64) {
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(NEXT_ROUND_DELAY).await;
            let Some(session) = server.registry.lookup(&code).await else {
                return;
            };
            let mut guard = session.lock().await;
            if guard.epoch() != epoch || guard.phase != Phase::InProgress || guard.round_active() {
                return;
            }
            guard.skip_disconnected_responsible();
            if let Err(err) = server.begin_round(&mut guard, &code, None).await {
                warn!("session {code}: could not start the next round: {err}");
            }
        });
    }

    async fn handle_disconnect(&self, conn_id: &str) {
        let binding = {
            let mut connections = self.connections.write().await;
            connections.remove(conn_id).and_then(|ctx| ctx.binding)
        };
        debug!("connection {conn_id} closed");
        let Some((code, name)) = binding else { return };
        let Some(session) = self.registry.lookup(&code).await else { return };
        let mut guard = session.lock().await;
        // A rejoin on a fresh socket may have superseded this connection.
        if guard.player(&name).and_then(|p| p.conn.as_deref()) != Some(conn_id) {
            return;
        }
        self.depart(&mut guard, &code, &name).await;
    }

    /// Shared exit path for explicit leaves and socket drops.
    async fn depart(&self, guard: &mut Session, code: &str, name: &str) {
        guard.touch(Instant::now());
        match guard.phase {
            Phase::Waiting => {
                let was_host = guard.host == name;
                guard.remove_player(name);
                if was_host || guard.players.is_empty() {
                    let reason =
                        if was_host { "the host left" } else { "everyone left" }.to_string();
                    self.broadcast(guard, &ServerMessage::SessionClosed { reason: reason.clone() })
                        .await;
                    self.unbind_all(guard).await;
                    self.registry.remove(code).await;
                    info!("session {code} closed ({reason})");
                } else {
                    self.broadcast(
                        guard,
                        &ServerMessage::PlayerLeft {
                            name: name.to_string(),
                            members: member_infos(guard),
                        },
                    )
                    .await;
                }
            }
            Phase::InProgress | Phase::Paused | Phase::Completed => {
                guard.mark_disconnected(name);
                info!("{name} disconnected from session {code}");
                self.broadcast(
                    guard,
                    &ServerMessage::PlayerLeft {
                        name: name.to_string(),
                        members: member_infos(guard),
                    },
                )
                .await;
                if guard.phase == Phase::InProgress {
                    if guard.connected_count() == 0 {
                        guard.pause(Instant::now());
                        self.broadcast(
                            guard,
                            &ServerMessage::GamePaused {
                                reason: "all players disconnected".into(),
                            },
                        )
                        .await;
                        info!("session {code} paused");
                    } else if guard.all_answered() {
                        // The drop may have been the last outstanding answer.
                        self.finish_round(guard, code).await;
                    }
                }
            }
        }
    }

    async fn binding_of(&self, conn_id: &str) -> Option<(String, String)> {
        self.connections.read().await.get(conn_id).and_then(|ctx| ctx.binding.clone())
    }

    async fn bound_session(
        &self,
        conn_id: &str,
    ) -> Result<(SharedSession, String, String), GameError> {
        let (code, name) = self.binding_of(conn_id).await.ok_or(GameError::NotInSession)?;
        let session =
            self.registry.lookup(&code).await.ok_or_else(|| GameError::NotFound(code.clone()))?;
        Ok((session, code, name))
    }

    async fn bind(&self, conn_id: &str, code: &str, name: &str) {
        let mut connections = self.connections.write().await;
        if let Some(ctx) = connections.get_mut(conn_id) {
            ctx.binding = Some((code.to_string(), name.to_string()));
        }
    }

    async fn unbind(&self, conn_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(ctx) = connections.get_mut(conn_id) {
            ctx.binding = None;
        }
    }

    /// Detach every member's connection from a session being torn down.
    async fn unbind_all(&self, session: &Session) {
        let conns: Vec<String> = session.players.iter().filter_map(|p| p.conn.clone()).collect();
        if conns.is_empty() {
            return;
        }
        let mut connections = self.connections.write().await;
        for conn in conns {
            if let Some(ctx) = connections.get_mut(&conn) {
                ctx.binding = None;
            }
        }
    }

    async fn send_to_conn(&self, conn_id: &str, message: &ServerMessage) {
        let Ok(text) = serde_json::to_string(message) else { return };
        let connections = self.connections.read().await;
        if let Some(ctx) = connections.get(conn_id) {
            if ctx.tx.send(Message::text(text)).is_err() {
                debug!("dropping message to {conn_id}: channel closed");
            }
        }
    }

    async fn broadcast(&self, session: &Session, message: &ServerMessage) {
        self.broadcast_except(session, message, None).await;
    }

    /// Deliver to every connected member of the session, in roster order.
    /// Callers hold the session lock, so delivery order matches the order
    /// transitions committed.
    async fn broadcast_except(
        &self,
        session: &Session,
        message: &ServerMessage,
        except: Option<&str>,
    ) {
        let Ok(text) = serde_json::to_string(message) else { return };
        let connections = self.connections.read().await;
        for player in &session.players {
            let Some(conn) = player.conn.as_deref() else { continue };
            if Some(conn) == except {
                continue;
            }
            if let Some(ctx) = connections.get(conn) {
                if ctx.tx.send(Message::text(text.clone())).is_err() {
                    debug!("skipping broadcast to {} ({conn}): channel closed", player.name);
                }
            }
        }
    }
}

/// Full-state view sent on join and rejoin, so late arrivals never depend on
/// having seen earlier incremental events.
fn snapshot_message(session: &Session, you: &str) -> ServerMessage {
    let round = session.current_round.as_ref().filter(|r| !r.resolved).map(|round| {
        let deadline_secs = match session.phase {
            Phase::InProgress => Some(round.remaining(Instant::now()).as_secs()),
            _ => round.paused_remaining.map(|d| d.as_secs()),
        };
        match &round.content {
            RoundContent::Prompt { word } => RoundSnapshot {
                number: round.number,
                responsible: round.responsible.clone(),
                prompt: (round.responsible == you).then(|| word.clone()),
                question: None,
                options: None,
                deadline_secs,
            },
            RoundContent::Question { question, options, .. } => RoundSnapshot {
                number: round.number,
                responsible: round.responsible.clone(),
                prompt: None,
                question: Some(question.clone()),
                options: options.clone(),
                deadline_secs,
            },
        }
    });
    ServerMessage::SessionJoined {
        code: session.code.clone(),
        variant: session.variant,
        phase: session.phase,
        host: session.host.clone(),
        you: you.to_string(),
        members: member_infos(session),
        round_number: session.round_number,
        total_rounds: session.settings.total_rounds,
        responsible: session.responsible().map(str::to_string),
        round,
    }
}
