//! Reference game rules: accounts, characters, movement and chat in one
//! shared rectangle.
//!
//! Accounts live in memory and are created on first login. Positions are
//! last-write-wins, so duplicated or reordered datagrams are harmless.

use crate::dispatch::{GameLogic, Response, SessionControl};
use crate::error::LogicError;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shared::{fields, tags, Envelope, MessageKind, SessionId};
use std::collections::HashMap;

pub const WORLD_WIDTH: f64 = 800.0;
pub const WORLD_HEIGHT: f64 = 600.0;
pub const MAX_CHAT_LENGTH: usize = 256;

#[derive(Debug, Clone)]
struct Account {
    password: String,
    characters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Player {
    pub session_id: SessionId,
    pub account: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
}

impl Player {
    fn position_update(&self) -> Envelope {
        Envelope::new(tags::PLAYER_MOVED)
            .with(fields::SESSION_ID, self.session_id)
            .with("x", self.x)
            .with("y", self.y)
    }
}

pub struct World {
    accounts: HashMap<String, Account>,
    /// Logged-in account per session
    logins: HashMap<SessionId, String>,
    /// Sessions that have picked a character
    players: HashMap<SessionId, Player>,
    rng: StdRng,
    messages_handled: u64,
}

impl World {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic spawns, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            accounts: HashMap::new(),
            logins: HashMap::new(),
            players: HashMap::new(),
            rng,
            messages_handled: 0,
        }
    }

    pub fn player(&self, session_id: SessionId) -> Option<&Player> {
        self.players.get(&session_id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_logged_in(&self, session_id: SessionId) -> bool {
        self.logins.contains_key(&session_id)
    }

    fn login(
        &mut self,
        ctx: &mut SessionControl,
        session_id: SessionId,
        envelope: &Envelope,
    ) -> Result<Vec<Response>, LogicError> {
        let username = required_str(envelope, "username")?.trim();
        if username.is_empty() {
            return Ok(vec![Response::unicast(
                session_id,
                Envelope::new(tags::LOGIN_FAILED).with("reason", "empty username"),
            )]);
        }
        let password = envelope.get_str("password").unwrap_or_default();

        let account = self
            .accounts
            .entry(username.to_string())
            .or_insert_with(|| {
                info!("Created account {}", username);
                Account {
                    password: password.to_string(),
                    characters: Vec::new(),
                }
            });

        if account.password != password {
            warn!("Failed login for {} from session {}", username, session_id);
            return Ok(vec![Response::unicast(
                session_id,
                Envelope::new(tags::LOGIN_FAILED).with("reason", "wrong password"),
            )]);
        }

        let reply = Envelope::new(tags::LOGIN_OK)
            .with("username", username)
            .with("characters", account.characters.clone());

        self.logins.insert(session_id, username.to_string());
        ctx.authenticate(session_id);
        info!("Session {} logged in as {}", session_id, username);

        Ok(vec![Response::unicast(session_id, reply)])
    }

    fn select_character(
        &mut self,
        session_id: SessionId,
        envelope: &Envelope,
    ) -> Result<Vec<Response>, LogicError> {
        let Some(username) = self.logins.get(&session_id).cloned() else {
            return Ok(vec![not_logged_in(session_id)]);
        };
        let name = required_str(envelope, "name")?.trim().to_string();
        if name.is_empty() {
            return Ok(vec![error_reply(session_id, "character name is empty")]);
        }

        if let Some(account) = self.accounts.get_mut(&username) {
            if !account.characters.contains(&name) {
                account.characters.push(name.clone());
            }
        }

        let player = Player {
            session_id,
            account: username,
            name,
            x: self.rng.gen_range(0.0..WORLD_WIDTH),
            y: self.rng.gen_range(0.0..WORLD_HEIGHT),
        };
        info!(
            "Session {} plays {} at ({:.1}, {:.1})",
            session_id, player.name, player.x, player.y
        );

        let selected = Envelope::new(tags::CHARACTER_SELECTED)
            .with("name", player.name.as_str())
            .with("x", player.x)
            .with("y", player.y);
        let joined = Envelope::new(tags::PLAYER_JOINED)
            .with(fields::SESSION_ID, session_id)
            .with("name", player.name.as_str())
            .with("x", player.x)
            .with("y", player.y);

        self.players.insert(session_id, player);

        Ok(vec![
            Response::unicast(session_id, selected),
            Response::broadcast_except(session_id, joined),
        ])
    }

    fn move_player(
        &mut self,
        session_id: SessionId,
        envelope: &Envelope,
    ) -> Result<Vec<Response>, LogicError> {
        let x = required_f64(envelope, "x")?;
        let y = required_f64(envelope, "y")?;

        let Some(player) = self.players.get_mut(&session_id) else {
            return Ok(vec![error_reply(session_id, "no character selected")]);
        };
        player.x = x.clamp(0.0, WORLD_WIDTH);
        player.y = y.clamp(0.0, WORLD_HEIGHT);

        Ok(vec![Response::broadcast(player.position_update())])
    }

    fn chat(&self, session_id: SessionId, envelope: &Envelope) -> Result<Vec<Response>, LogicError> {
        let Some(username) = self.logins.get(&session_id) else {
            return Ok(vec![not_logged_in(session_id)]);
        };
        let text: String = required_str(envelope, "text")?
            .chars()
            .take(MAX_CHAT_LENGTH)
            .collect();

        let from = self
            .players
            .get(&session_id)
            .map_or(username.as_str(), |player| player.name.as_str());

        let message = Envelope::new(tags::CHAT)
            .with(fields::SESSION_ID, session_id)
            .with("from", from)
            .with("text", text);

        Ok(vec![Response::broadcast_except(session_id, message)])
    }

    fn snapshot(&self, tick: u64) -> Envelope {
        let mut players: Vec<&Player> = self.players.values().collect();
        players.sort_by_key(|player| player.session_id);

        let players = serde_json::to_value(players).unwrap_or_default();
        Envelope::new(tags::WORLD_STATE)
            .with("tick", tick)
            .with("players", players)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl GameLogic for World {
    fn handle(
        &mut self,
        ctx: &mut SessionControl,
        envelope: &Envelope,
    ) -> Result<Vec<Response>, LogicError> {
        let session_id = envelope
            .session_id()
            .ok_or(LogicError::MissingField {
                tag: envelope.tag().to_string(),
                field: fields::SESSION_ID,
            })?;
        self.messages_handled += 1;

        match envelope.kind() {
            MessageKind::Login => self.login(ctx, session_id, envelope),
            MessageKind::SelectCharacter => self.select_character(session_id, envelope),
            MessageKind::Move => self.move_player(session_id, envelope),
            MessageKind::Chat => self.chat(session_id, envelope),
            MessageKind::Ping => Ok(vec![Response::unicast(
                session_id,
                Envelope::new(tags::PONG).with("server_tick", ctx.tick()),
            )]),
            MessageKind::Heartbeat => Ok(Vec::new()),
            MessageKind::Disconnect => {
                ctx.disconnect(session_id);
                Ok(Vec::new())
            }
            MessageKind::Unknown(tag) => {
                warn!("Ignoring unknown message type `{}` from session {}", tag, session_id);
                Ok(Vec::new())
            }
        }
    }

    fn on_session_closed(&mut self, _ctx: &mut SessionControl, session_id: SessionId) -> Vec<Response> {
        self.logins.remove(&session_id);

        match self.players.remove(&session_id) {
            Some(player) => {
                info!("{} left the world", player.name);
                let left = Envelope::new(tags::PLAYER_LEFT)
                    .with(fields::SESSION_ID, session_id)
                    .with("name", player.name);
                vec![Response::broadcast_except(session_id, left)]
            }
            None => Vec::new(),
        }
    }

    fn periodic_update(&mut self, ctx: &mut SessionControl) -> Vec<Response> {
        if self.players.is_empty() {
            return Vec::new();
        }
        vec![Response::broadcast(self.snapshot(ctx.tick()))]
    }

    fn flush(&mut self) {
        info!(
            "World saved: {} accounts, {} players online, {} messages handled",
            self.accounts.len(),
            self.players.len(),
            self.messages_handled
        );
    }
}

fn required_str<'a>(envelope: &'a Envelope, field: &'static str) -> Result<&'a str, LogicError> {
    envelope.get_str(field).ok_or_else(|| LogicError::MissingField {
        tag: envelope.tag().to_string(),
        field,
    })
}

fn required_f64(envelope: &Envelope, field: &'static str) -> Result<f64, LogicError> {
    envelope.get_f64(field).ok_or_else(|| LogicError::MissingField {
        tag: envelope.tag().to_string(),
        field,
    })
}

fn error_reply(session_id: SessionId, message: &str) -> Response {
    Response::unicast(session_id, Envelope::new(tags::ERROR).with("message", message))
}

fn not_logged_in(session_id: SessionId) -> Response {
    error_reply(session_id, "not logged in")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{SessionUpdate, Target};
    use assert_approx_eq::assert_approx_eq;

    fn msg(session_id: SessionId, kind: &str) -> Envelope {
        let mut envelope = Envelope::new(kind);
        envelope.set_session_id(session_id);
        envelope
    }

    fn handle(world: &mut World, envelope: Envelope) -> Vec<Response> {
        let mut ctx = SessionControl::new(7, 2);
        world.handle(&mut ctx, &envelope).unwrap()
    }

    fn logged_in_world() -> World {
        let mut world = World::with_seed(42);
        for (id, user) in [(1, "alice"), (2, "bob")] {
            handle(&mut world, msg(id, "login").with("username", user).with("password", "pw"));
        }
        world
    }

    #[test]
    fn test_first_login_creates_account_and_authenticates() {
        let mut world = World::with_seed(1);
        let mut ctx = SessionControl::new(0, 1);

        let responses = world
            .handle(&mut ctx, &msg(1, "login").with("username", "alice").with("password", "pw"))
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].target, Target::Unicast(1));
        assert_eq!(responses[0].payload.tag(), tags::LOGIN_OK);
        assert_eq!(ctx.updates(), &[SessionUpdate::Authenticate(1)]);
        assert_eq!(world.account_count(), 1);
        assert!(world.is_logged_in(1));
    }

    #[test]
    fn test_wrong_password_fails_without_authenticating() {
        let mut world = logged_in_world();
        let mut ctx = SessionControl::new(0, 3);

        let responses = world
            .handle(&mut ctx, &msg(3, "login").with("username", "alice").with("password", "nope"))
            .unwrap();

        assert_eq!(responses[0].payload.tag(), tags::LOGIN_FAILED);
        assert!(ctx.updates().is_empty());
        assert!(!world.is_logged_in(3));
    }

    #[test]
    fn test_login_without_username_is_an_error() {
        let mut world = World::with_seed(1);
        let mut ctx = SessionControl::new(0, 1);

        let err = world.handle(&mut ctx, &msg(1, "login")).unwrap_err();
        assert!(matches!(err, LogicError::MissingField { field: "username", .. }));
    }

    #[test]
    fn test_requests_before_login_get_error_reply() {
        let mut world = World::with_seed(1);

        for kind in ["select_character", "chat"] {
            let responses = handle(&mut world, msg(9, kind).with("name", "x").with("text", "x"));
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].payload.tag(), tags::ERROR);
            assert_eq!(responses[0].target, Target::Unicast(9));
        }
    }

    #[test]
    fn test_select_character_spawns_inside_world() {
        let mut world = logged_in_world();

        let responses = handle(&mut world, msg(1, "select_character").with("name", "Ayla"));

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].payload.tag(), tags::CHARACTER_SELECTED);
        assert_eq!(responses[1].target, Target::Broadcast { exclude: Some(1) });
        assert_eq!(responses[1].payload.tag(), tags::PLAYER_JOINED);

        let player = world.player(1).unwrap();
        assert_eq!(player.name, "Ayla");
        assert!((0.0..WORLD_WIDTH).contains(&player.x));
        assert!((0.0..WORLD_HEIGHT).contains(&player.y));
    }

    #[test]
    fn test_move_is_clamped_and_last_write_wins() {
        let mut world = logged_in_world();
        handle(&mut world, msg(1, "select_character").with("name", "Ayla"));

        handle(&mut world, msg(1, "move").with("x", 100.0).with("y", 50.0));
        let responses = handle(&mut world, msg(1, "move").with("x", -20.0).with("y", 10_000.0));

        let player = world.player(1).unwrap();
        assert_approx_eq!(player.x, 0.0);
        assert_approx_eq!(player.y, WORLD_HEIGHT);
        assert_eq!(responses[0].target, Target::Broadcast { exclude: None });
        assert_approx_eq!(responses[0].payload.get_f64("y").unwrap(), WORLD_HEIGHT);
    }

    #[test]
    fn test_move_without_character() {
        let mut world = logged_in_world();
        let responses = handle(&mut world, msg(2, "move").with("x", 1.0).with("y", 1.0));
        assert_eq!(responses[0].payload.tag(), tags::ERROR);
    }

    #[test]
    fn test_chat_goes_to_everyone_but_sender() {
        let mut world = logged_in_world();
        handle(&mut world, msg(1, "select_character").with("name", "Ayla"));

        let responses = handle(&mut world, msg(1, "chat").with("text", "hello ✓"));

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].target, Target::Broadcast { exclude: Some(1) });
        assert_eq!(responses[0].payload.get_str("from"), Some("Ayla"));
        assert_eq!(responses[0].payload.get_str("text"), Some("hello ✓"));
    }

    #[test]
    fn test_ping_pong_and_quiet_messages() {
        let mut world = World::with_seed(1);

        let responses = handle(&mut world, msg(5, "ping"));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].payload.tag(), tags::PONG);
        assert_eq!(responses[0].target, Target::Unicast(5));

        assert!(handle(&mut world, msg(5, "heartbeat")).is_empty());
        assert!(handle(&mut world, msg(5, "dance")).is_empty());
    }

    #[test]
    fn test_session_close_announces_departure_once() {
        let mut world = logged_in_world();
        handle(&mut world, msg(1, "select_character").with("name", "Ayla"));
        let mut ctx = SessionControl::new(0, 2);

        let first = world.on_session_closed(&mut ctx, 1);
        let second = world.on_session_closed(&mut ctx, 1);

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload.tag(), tags::PLAYER_LEFT);
        assert!(second.is_empty());
        assert!(!world.is_logged_in(1));
        assert_eq!(world.player_count(), 0);
    }

    #[test]
    fn test_world_state_only_with_players() {
        let mut world = logged_in_world();
        let mut ctx = SessionControl::new(3, 2);
        assert!(world.periodic_update(&mut ctx).is_empty());

        handle(&mut world, msg(2, "select_character").with("name", "Bram"));
        handle(&mut world, msg(1, "select_character").with("name", "Ayla"));

        let responses = world.periodic_update(&mut ctx);
        assert_eq!(responses.len(), 1);
        let players = responses[0].payload.get("players").unwrap().as_array().unwrap();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0]["name"], "Ayla");
    }

    #[test]
    fn test_disconnect_message_requests_session_close() {
        let mut world = World::with_seed(1);
        let mut ctx = SessionControl::new(0, 1);

        world.handle(&mut ctx, &msg(4, "disconnect")).unwrap();
        assert_eq!(ctx.updates(), &[SessionUpdate::Disconnect(4)]);
    }
}
