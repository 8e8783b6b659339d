use crate::Session;
use rhymux_common::{RoomId, ServerCommand, UserInfo};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Weak,
};
use tokio::sync::RwLock;
use tracing::warn;

/// Opaque generation counter invalidating stale dangle-cleanup timers.
/// Bumped every time a session attaches; a cleanup fired with a stale
/// token is a silent no-op (Design Notes §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DangleToken(u64);

pub struct User {
    pub id: i32,
    pub name: String,
    /// IETF language tag reported by the identity service. Carried as a
    /// contract field only — message localisation is out of scope here.
    pub language: String,

    pub room: RwLock<Option<RoomId>>,
    session: RwLock<Option<Weak<Session>>>,

    monitor: AtomicBool,
    game_time_bits: AtomicU32,
    dangle_token: AtomicU64,
}

impl User {
    pub fn new(id: i32, name: String, language: String) -> Self {
        Self {
            id,
            name,
            language,

            room: RwLock::default(),
            session: RwLock::default(),

            monitor: AtomicBool::new(false),
            game_time_bits: AtomicU32::new(f32::NEG_INFINITY.to_bits()),
            dangle_token: AtomicU64::new(0),
        }
    }

    pub fn to_info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            name: self.name.clone(),
            monitor: self.is_monitor(),
        }
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor.load(Ordering::SeqCst)
    }

    pub fn set_monitor(&self, monitor: bool) {
        self.monitor.store(monitor, Ordering::SeqCst);
    }

    pub fn game_time(&self) -> f32 {
        f32::from_bits(self.game_time_bits.load(Ordering::SeqCst))
    }

    pub fn set_game_time(&self, time: f32) {
        self.game_time_bits.store(time.to_bits(), Ordering::SeqCst);
    }

    /// Reset to `-infinity` at game start (spec §3).
    pub fn reset_game_time(&self) {
        self.game_time_bits
            .store(f32::NEG_INFINITY.to_bits(), Ordering::SeqCst);
    }

    pub async fn session(&self) -> Option<std::sync::Arc<Session>> {
        self.session.read().await.as_ref().and_then(Weak::upgrade)
    }

    /// Attach a new session, bumping the dangle token so any pending
    /// cleanup timer from a previous loss becomes a no-op.
    pub async fn set_session(&self, session: Weak<Session>) {
        *self.session.write().await = Some(session);
        self.dangle_token.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn clear_session(&self) {
        *self.session.write().await = None;
    }

    /// A session is "stale" if it's still referenced but its socket has
    /// already been observed half-closed or dead. Authenticating over a
    /// stale session evicts it instead of rejecting with
    /// `auth-account-already-online`.
    pub async fn has_live_session(&self) -> bool {
        match self.session().await {
            Some(session) => !session.is_closed(),
            None => false,
        }
    }

    pub async fn try_send(&self, cmd: ServerCommand) {
        if let Some(session) = self.session().await {
            session.try_send(cmd).await;
        } else {
            warn!("sending {cmd:?} to dangling user {}", self.id);
        }
    }

    /// New dangle token; returns it so the caller can schedule a cleanup
    /// timer that re-checks `is_still_dangling` before acting.
    pub fn mark_dangle(&self) -> DangleToken {
        DangleToken(self.dangle_token.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub async fn is_still_dangling(&self, token: DangleToken) -> bool {
        self.session.read().await.is_none()
            && self.dangle_token.load(Ordering::SeqCst) == token.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dangle_token_matches_immediately_after_marking() {
        let user = User::new(1, "alice".to_owned(), "en".to_owned());
        let token = user.mark_dangle();
        assert!(user.is_still_dangling(token).await);
    }

    /// Any later bump (a real reattach calls `set_session`, which bumps the
    /// same counter) supersedes an earlier dangle token, making a pending
    /// cleanup timer fired with the stale token a no-op.
    #[tokio::test]
    async fn stale_dangle_token_is_invalidated_by_a_later_bump() {
        let user = User::new(1, "alice".to_owned(), "en".to_owned());
        let stale = user.mark_dangle();
        let _fresh = user.mark_dangle();
        assert!(!user.is_still_dangling(stale).await);
    }

    #[test]
    fn game_time_resets_to_negative_infinity() {
        let user = User::new(1, "alice".to_owned(), "en".to_owned());
        user.set_game_time(12.5);
        assert_eq!(user.game_time(), 12.5);
        user.reset_game_time();
        assert_eq!(user.game_time(), f32::NEG_INFINITY);
    }

    #[test]
    fn to_info_reflects_monitor_flag() {
        let user = User::new(7, "bob".to_owned(), "en".to_owned());
        assert!(!user.to_info().monitor);
        user.set_monitor(true);
        assert!(user.to_info().monitor);
    }
}
