//! The operator-facing surface: plain async methods an external layer
//! (a CLI, an HTTP handler, whatever fronts the process) calls directly —
//! there is no admin protocol of its own here. Every entry point takes the
//! command-dispatch mutex exactly once, same as a client command, so admin
//! actions interleave with gameplay under the same observable ordering.

use crate::{
    error::{ROOM_INVALID_STATE, ROOM_NOT_FOUND},
    room::Room,
    session, ServerState,
};
use anyhow::{bail, Result};
use rhymux_common::{Message, RoomId, RoomState, ServerCommand};
use std::{collections::HashSet, sync::Arc};
use tracing::info;

pub struct Admin {
    server: Arc<ServerState>,
}

/// Clamp to 200 characters (not bytes) so the value still round-trips
/// through a `Varchar<200>`-backed wire field without truncating mid
/// multi-byte codepoint.
fn bound_chat_text(text: String) -> String {
    text.chars().take(200).collect()
}

impl Admin {
    pub fn new(server: Arc<ServerState>) -> Self {
        Self { server }
    }

    async fn room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        self.server.room(room_id).await.ok_or_else(|| anyhow::anyhow!(ROOM_NOT_FOUND))
    }

    pub async fn set_room_max_users(&self, room_id: &RoomId, max_users: usize) -> Result<()> {
        let _permit = self.server.command_lock.lock().await;
        let room = self.room(room_id).await?;
        room.set_max_users(max_users);
        info!(room = room_id.to_string(), max_users, "admin: set room max users");
        Ok(())
    }

    pub async fn disband_room(&self, room_id: &RoomId) -> Result<()> {
        {
            let _permit = self.server.command_lock.lock().await;
            let room = self.room(room_id).await?;
            self.server.remove_room(room_id).await;
            // Deregistering and disbanding happen under the same permit so
            // a concurrent JoinRoom/LeaveRoom can never observe the room
            // gone from the registry while members still think they're in
            // it (or vice versa).
            room.disband().await;
        }
        self.server.replay.end_room(room_id).await;
        info!(room = room_id.to_string(), "admin: disbanded room");
        Ok(())
    }

    pub async fn set_contest(
        &self,
        room_id: &RoomId,
        manual_start: bool,
        auto_disband: bool,
        whitelist: Option<Vec<i32>>,
    ) -> Result<()> {
        let _permit = self.server.command_lock.lock().await;
        let room = self.room(room_id).await?;
        room.set_contest(
            manual_start,
            auto_disband,
            whitelist.map(|it| it.into_iter().collect::<HashSet<_>>()),
        )
        .await;
        info!(room = room_id.to_string(), manual_start, auto_disband, "admin: set contest");
        Ok(())
    }

    pub async fn clear_contest(&self, room_id: &RoomId) -> Result<()> {
        let _permit = self.server.command_lock.lock().await;
        let room = self.room(room_id).await?;
        room.clear_contest().await;
        Ok(())
    }

    pub async fn update_contest_whitelist(&self, room_id: &RoomId, ids: Vec<i32>) -> Result<()> {
        let _permit = self.server.command_lock.lock().await;
        let room = self.room(room_id).await?;
        room.update_contest_whitelist(ids).await
    }

    pub async fn start_contest(&self, room_id: &RoomId, force: bool) -> Result<()> {
        let _permit = self.server.command_lock.lock().await;
        let room = self.room(room_id).await?;
        room.start_contest(force).await
    }

    /// Chat with `user=0` broadcast to every room (not every connected
    /// user — a user between rooms receives nothing), `content` bounded to
    /// 200 characters.
    pub async fn broadcast_all(&self, content: String) -> Result<()> {
        let content = bound_chat_text(content);
        let rooms: Vec<_> = {
            let _permit = self.server.command_lock.lock().await;
            self.server.rooms.read().await.values().cloned().collect()
        };
        for room in rooms {
            room.send(Message::Chat { user: 0, content: content.clone() }).await;
        }
        info!("admin: broadcast to all rooms");
        Ok(())
    }

    pub async fn room_chat(&self, room_id: &RoomId, content: String) -> Result<()> {
        let content = bound_chat_text(content);
        let room = {
            let _permit = self.server.command_lock.lock().await;
            self.room(room_id).await?
        };
        room.send(Message::Chat { user: 0, content }).await;
        Ok(())
    }

    pub async fn set_replay_enabled(&self, enabled: bool) {
        let _permit = self.server.command_lock.lock().await;
        self.server.set_replay_enabled(enabled);
        info!(enabled, "admin: set replay toggle");
    }

    pub async fn set_room_creation_enabled(&self, enabled: bool) {
        let _permit = self.server.command_lock.lock().await;
        self.server.set_room_creation_enabled(enabled);
        info!(enabled, "admin: set room creation toggle");
    }

    pub async fn ban_user(&self, user_id: i32) {
        let _permit = self.server.command_lock.lock().await;
        self.server.ban_user(user_id).await;
        info!(user = user_id, "admin: banned user");
    }

    pub async fn unban_user(&self, user_id: i32) {
        let _permit = self.server.command_lock.lock().await;
        self.server.unban_user(user_id).await;
        info!(user = user_id, "admin: unbanned user");
    }

    pub async fn ban_room_user(&self, room_id: &RoomId, user_id: i32) {
        let _permit = self.server.command_lock.lock().await;
        self.server.ban_room_user(room_id, user_id).await;
    }

    pub async fn unban_room_user(&self, room_id: &RoomId, user_id: i32) {
        let _permit = self.server.command_lock.lock().await;
        self.server.unban_room_user(room_id, user_id).await;
    }

    /// Force-disconnects a user's active session, if any. `preserve_room`
    /// keeps their room seat regardless of what state the room is in,
    /// skipping the usual dangle window entirely.
    pub async fn admin_disconnect(&self, user_id: i32, preserve_room: bool) -> Result<()> {
        let user = {
            let _permit = self.server.command_lock.lock().await;
            self.server.user(user_id).await
        };
        let Some(user) = user else { return Ok(()) };
        if let Some(session) = user.session().await {
            self.server.sessions.write().await.remove(&session.id);
        }
        session::handle_loss(user, Arc::clone(&self.server), preserve_room).await;
        info!(user = user_id, preserve_room, "admin: disconnected user");
        Ok(())
    }

    /// Relocates a disconnected user into `target`. Requires the user to
    /// currently have no live session and both the source room (if any) and
    /// the target room to be in `SelectChart` — unlike a player-initiated
    /// join, the target room still runs `validate_join` (locks, bans,
    /// contest whitelist, monitor eligibility all still apply; this is a
    /// relocation, not a bypass of room policy).
    pub async fn move_user(&self, user_id: i32, target_id: &RoomId, monitor: bool) -> Result<()> {
        let _permit = self.server.command_lock.lock().await;
        let user = self.server.user(user_id).await.ok_or_else(|| anyhow::anyhow!(ROOM_NOT_FOUND))?;
        if user.has_live_session().await {
            bail!(ROOM_INVALID_STATE);
        }

        let current = match user.room.read().await.clone() {
            Some(current_id) => self.server.room(&current_id).await,
            None => None,
        };
        if let Some(current) = &current {
            if !matches!(current.client_room_state().await, RoomState::SelectChart(_)) {
                bail!(ROOM_INVALID_STATE);
            }
        }

        let target_room = self.room(target_id).await?;
        if !matches!(target_room.client_room_state().await, RoomState::SelectChart(_)) {
            bail!(ROOM_INVALID_STATE);
        }
        target_room
            .validate_join(user_id, monitor, self.server.can_monitor(user_id))
            .await?;

        if let Some(current) = current {
            *user.room.write().await = None;
            if current.on_user_leave(user_id, &user.name).await {
                self.server.remove_room(&current.id).await;
            }
        }

        if !target_room.add_user(user_id, monitor).await {
            bail!(crate::error::JOIN_ROOM_FULL);
        }
        user.set_monitor(monitor);
        *user.room.write().await = Some(target_id.clone());
        target_room
            .broadcast(ServerCommand::OnJoinRoom(user.to_info()))
            .await;
        target_room
            .send(Message::JoinRoom { user: user_id, name: user.name.clone() })
            .await;
        info!(user = user_id, room = target_id.to_string(), "admin: moved user into room");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, User};

    async fn test_state() -> Arc<ServerState> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = crate::Server::new(listener, Config::default());
        Arc::clone(&server.state)
    }

    async fn register_room(server: &Arc<ServerState>, id: &str, host_id: i32) -> Arc<Room> {
        let room_id: RoomId = id.to_owned().try_into().unwrap();
        let room = Arc::new(Room::new(room_id.clone(), host_id, 8, false, false, Arc::clone(server)));
        server.rooms.write().await.insert(room_id, Arc::clone(&room));
        room
    }

    async fn register_user(server: &Arc<ServerState>, id: i32) {
        server
            .users
            .write()
            .await
            .insert(id, Arc::new(User::new(id, format!("user{id}"), "en".to_owned())));
    }

    #[tokio::test]
    async fn move_user_relocates_a_disconnected_player_into_select_chart_room() {
        let server = test_state().await;
        register_user(&server, 200).await;
        let target = register_room(&server, "room2", 999).await;
        let admin = Admin::new(Arc::clone(&server));

        admin.move_user(200, &target.id, false).await.unwrap();

        let user = server.user(200).await.unwrap();
        assert_eq!(user.room.read().await.clone(), Some(target.id.clone()));
        assert!(target.user_ids().await.contains(&200));
    }

    #[tokio::test]
    async fn move_user_honours_target_room_policy() {
        let server = test_state().await;
        register_user(&server, 200).await;
        let target = register_room(&server, "room2", 999).await;
        target.set_locked(true);
        let admin = Admin::new(Arc::clone(&server));

        let err = admin.move_user(200, &target.id, false).await.unwrap_err();
        assert_eq!(err.to_string(), crate::error::JOIN_ROOM_LOCKED);
    }

    #[tokio::test]
    async fn move_user_requires_source_room_in_select_chart() {
        let server = test_state().await;
        register_user(&server, 200).await;
        let source = register_room(&server, "room1", 200).await;
        let target = register_room(&server, "room2", 999).await;
        *server.user(200).await.unwrap().room.write().await = Some(source.id.clone());
        source.select_chart(200, crate::identity::Chart { id: 1, name: "c".into() }).await.unwrap();
        source.request_start(200).await.unwrap();

        let admin = Admin::new(Arc::clone(&server));
        let err = admin.move_user(200, &target.id, false).await.unwrap_err();
        assert_eq!(err.to_string(), ROOM_INVALID_STATE);
    }
}
