use crate::{
    config::Config, identity::IdentityClient, replay::ReplayRecorder, room::Room, session::Session,
    user::User,
};
use anyhow::Result;
use rhymux_common::{RoomId, UserInfo};
use std::{
    collections::{
        hash_map::{Entry, VacantEntry},
        HashMap, HashSet,
    },
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

pub type SafeMap<K, V> = RwLock<HashMap<K, V>>;
pub type IdMap<V> = SafeMap<Uuid, V>;

fn vacant_entry<V>(map: &mut HashMap<Uuid, V>) -> VacantEntry<'_, Uuid, V> {
    let mut id = Uuid::new_v4();
    while map.contains_key(&id) {
        id = Uuid::new_v4();
    }
    match map.entry(id) {
        Entry::Vacant(entry) => entry,
        _ => unreachable!(),
    }
}

/// Process-wide state. A single [`Mutex<()>`] permit, acquired once per
/// client command and once per admin operation, gives the whole surface an
/// observable "one command at a time" property instead of relying on the
/// finer-grained per-map locks below to compose safely on their own.
pub struct ServerState {
    pub sessions: IdMap<Arc<Session>>,
    pub users: SafeMap<i32, Arc<User>>,
    pub rooms: SafeMap<RoomId, Arc<Room>>,

    pub config: Config,
    pub identity: IdentityClient,
    pub replay: ReplayRecorder,

    pub command_lock: Mutex<()>,

    /// Runtime toggles (spec §3's `replayEnabled`/`roomCreationEnabled`):
    /// seeded from `config` at startup but independent of it afterward.
    replay_enabled: AtomicBool,
    room_creation_enabled: AtomicBool,

    banned_users: RwLock<HashSet<i32>>,
    banned_room_users: RwLock<HashMap<RoomId, HashSet<i32>>>,

    lost_con_tx: mpsc::Sender<Uuid>,
}

impl ServerState {
    pub async fn user(&self, id: i32) -> Option<Arc<User>> {
        self.users.read().await.get(&id).cloned()
    }

    pub async fn room(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn remove_room(&self, id: &RoomId) {
        self.rooms.write().await.remove(id);
        self.banned_room_users.write().await.remove(id);
    }

    pub async fn room_member_infos(&self, room: &Room) -> HashMap<i32, UserInfo> {
        let mut infos = HashMap::new();
        for id in room.member_ids().await {
            if let Some(user) = self.user(id).await {
                infos.insert(id, user.to_info());
            }
        }
        infos
    }

    pub fn can_monitor(&self, user_id: i32) -> bool {
        self.config.monitors.contains(&user_id)
    }

    pub fn replay_enabled(&self) -> bool {
        self.replay_enabled.load(Ordering::SeqCst)
    }

    pub fn set_replay_enabled(&self, enabled: bool) {
        self.replay_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn room_creation_enabled(&self) -> bool {
        self.room_creation_enabled.load(Ordering::SeqCst)
    }

    pub fn set_room_creation_enabled(&self, enabled: bool) {
        self.room_creation_enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn is_banned(&self, user_id: i32) -> bool {
        self.banned_users.read().await.contains(&user_id)
    }

    pub async fn ban_user(&self, user_id: i32) {
        self.banned_users.write().await.insert(user_id);
    }

    pub async fn unban_user(&self, user_id: i32) {
        self.banned_users.write().await.remove(&user_id);
    }

    pub async fn is_room_banned(&self, room_id: &RoomId, user_id: i32) -> bool {
        self.banned_room_users
            .read()
            .await
            .get(room_id)
            .map_or(false, |it| it.contains(&user_id))
    }

    pub async fn ban_room_user(&self, room_id: &RoomId, user_id: i32) {
        self.banned_room_users
            .write()
            .await
            .entry(room_id.clone())
            .or_default()
            .insert(user_id);
    }

    pub async fn unban_room_user(&self, room_id: &RoomId, user_id: i32) {
        if let Some(set) = self.banned_room_users.write().await.get_mut(room_id) {
            set.remove(&user_id);
        }
    }

    /// Mark a connection lost; the accept loop's watcher task takes it from
    /// here, evicting the session and handing the user off to
    /// [`crate::session::handle_loss`].
    pub async fn mark_lost(&self, id: Uuid) {
        if let Err(err) = self.lost_con_tx.send(id).await {
            warn!("failed to mark lost connection ({id}): {err:?}");
        }
    }
}

pub struct Server {
    pub state: Arc<ServerState>,
    listener: TcpListener,

    lost_con_handle: JoinHandle<()>,
}

impl Server {
    pub fn new(listener: TcpListener, config: Config) -> Self {
        let (lost_con_tx, mut lost_con_rx) = mpsc::channel(16);
        let replay_enabled = AtomicBool::new(config.replay_enabled);
        let room_creation_enabled = AtomicBool::new(config.room_creation_enabled);
        let state = Arc::new(ServerState {
            sessions: IdMap::default(),
            users: SafeMap::default(),
            rooms: SafeMap::default(),

            identity: IdentityClient::new(config.identity_host.clone()),
            replay: ReplayRecorder::new(config.replay_base_dir.clone()),
            config,

            command_lock: Mutex::new(()),
            replay_enabled,
            room_creation_enabled,

            banned_users: RwLock::default(),
            banned_room_users: RwLock::default(),

            lost_con_tx,
        });
        let lost_con_handle = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                while let Some(id) = lost_con_rx.recv().await {
                    warn!("lost connection with {id}");
                    if let Some(session) = state.sessions.write().await.remove(&id) {
                        let still_current = session
                            .user
                            .session()
                            .await
                            .map_or(false, |it| Arc::ptr_eq(&it, &session));
                        if still_current {
                            crate::session::handle_loss(
                                Arc::clone(&session.user),
                                Arc::clone(&state),
                                false,
                            )
                            .await;
                        }
                    }
                }
            }
        });

        Self {
            listener,
            state,
            lost_con_handle,
        }
    }

    pub async fn accept(&self) -> Result<()> {
        let (stream, addr) = self.listener.accept().await?;
        let mut guard = self.state.sessions.write().await;
        let entry = vacant_entry(&mut guard);
        let id = *entry.key();
        drop(guard);
        let session = Session::new(id, stream, Arc::clone(&self.state)).await?;
        info!("received connection from {addr} ({id})");
        self.state.sessions.write().await.insert(id, session);
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.lost_con_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    async fn test_state() -> Arc<ServerState> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Config::default());
        Arc::clone(&server.state)
    }

    #[tokio::test]
    async fn server_wide_ban_is_independent_of_room_ban() {
        let state = test_state().await;
        let room_id: RoomId = "room1".to_owned().try_into().unwrap();

        assert!(!state.is_banned(100).await);
        state.ban_user(100).await;
        assert!(state.is_banned(100).await);
        state.unban_user(100).await;
        assert!(!state.is_banned(100).await);

        assert!(!state.is_room_banned(&room_id, 200).await);
        state.ban_room_user(&room_id, 200).await;
        assert!(state.is_room_banned(&room_id, 200).await);
        assert!(!state.is_banned(200).await);
        state.unban_room_user(&room_id, 200).await;
        assert!(!state.is_room_banned(&room_id, 200).await);
    }

    #[tokio::test]
    async fn removing_a_room_also_drops_its_ban_list() {
        let state = test_state().await;
        let room_id: RoomId = "room1".to_owned().try_into().unwrap();
        state.ban_room_user(&room_id, 200).await;
        state.remove_room(&room_id).await;
        assert!(!state.is_room_banned(&room_id, 200).await);
    }

    #[tokio::test]
    async fn vacant_entry_never_collides_with_an_existing_key() {
        let mut map: HashMap<Uuid, ()> = HashMap::new();
        let taken = Uuid::new_v4();
        map.insert(taken, ());
        let entry = vacant_entry(&mut map);
        assert_ne!(*entry.key(), taken);
    }
}
