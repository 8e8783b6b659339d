use crate::{
    error::{
        JOIN_CANT_MONITOR, JOIN_GAME_ONGOING, JOIN_ROOM_LOCKED, RECORD_ALREADY_UPLOADED,
        ROOM_ALREADY_READY, ROOM_BANNED, ROOM_GAME_ABORTED, ROOM_INVALID_STATE, ROOM_NOT_READY,
        ROOM_NOT_WHITELISTED, ROOM_ONLY_HOST, START_NO_CHART_SELECTED,
    },
    identity::{Chart, Record},
    ServerState,
};
use anyhow::{bail, Result};
use rhymux_common::{ClientRoomState, Message, RoomId, RoomState, ServerCommand, UserInfo};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
pub struct Contest {
    pub whitelist: HashSet<i32>,
    pub manual_start: bool,
    pub auto_disband: bool,
}

#[derive(Default, Debug)]
pub enum InternalRoomState {
    #[default]
    SelectChart,
    WaitForReady {
        started: HashSet<i32>,
    },
    Playing {
        /// Insertion order matters for the settlement tie-break, so this is
        /// a plain `Vec` rather than a `HashMap`.
        results: Vec<(i32, Record)>,
        aborted: HashSet<i32>,
    },
}

impl InternalRoomState {
    fn to_client(&self, chart: Option<i32>) -> RoomState {
        match self {
            Self::SelectChart => RoomState::SelectChart(chart),
            Self::WaitForReady { .. } => RoomState::WaitingForReady,
            Self::Playing { .. } => RoomState::Playing,
        }
    }
}

pub struct Room {
    pub id: RoomId,
    pub replay_eligible: bool,

    server: Arc<ServerState>,

    host_id: RwLock<i32>,
    state: RwLock<InternalRoomState>,
    chart: RwLock<Option<Chart>>,
    contest: RwLock<Option<Contest>>,

    max_users: AtomicUsize,
    live: AtomicBool,
    locked: AtomicBool,
    cycle: AtomicBool,

    /// Insertion order is significant: it drives host-migration tie-break
    /// and cycle rotation.
    users: RwLock<Vec<i32>>,
    monitors: RwLock<Vec<i32>>,
}

impl Room {
    pub fn new(
        id: RoomId,
        host_id: i32,
        max_users: usize,
        replay_eligible: bool,
        live: bool,
        server: Arc<ServerState>,
    ) -> Self {
        Self {
            id,
            replay_eligible,
            server,

            host_id: RwLock::new(host_id),
            state: RwLock::default(),
            chart: RwLock::default(),
            contest: RwLock::default(),

            max_users: AtomicUsize::new(max_users),
            live: AtomicBool::new(live),
            locked: AtomicBool::new(false),
            cycle: AtomicBool::new(false),

            users: RwLock::new(vec![host_id]),
            monitors: RwLock::new(Vec::new()),
        }
    }

    pub async fn host_id(&self) -> i32 {
        *self.host_id.read().await
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn cycle(&self) -> bool {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn set_cycle(&self, cycle: bool) {
        self.cycle.store(cycle, Ordering::SeqCst);
    }

    pub fn set_max_users(&self, n: usize) {
        self.max_users.store(n.clamp(1, 64), Ordering::SeqCst);
    }

    pub async fn chart_id(&self) -> Option<i32> {
        self.chart.read().await.as_ref().map(|it| it.id)
    }

    pub async fn user_ids(&self) -> Vec<i32> {
        self.users.read().await.clone()
    }

    pub async fn monitor_ids(&self) -> Vec<i32> {
        self.monitors.read().await.clone()
    }

    pub async fn member_ids(&self) -> Vec<i32> {
        let mut ids = self.user_ids().await;
        ids.extend(self.monitor_ids().await);
        ids
    }

    pub async fn has_contest(&self) -> bool {
        self.contest.read().await.is_some()
    }

    pub async fn client_room_state(&self) -> RoomState {
        self.state
            .read()
            .await
            .to_client(self.chart.read().await.as_ref().map(|it| it.id))
    }

    pub async fn is_ready(&self, user_id: i32) -> bool {
        matches!(
            &*self.state.read().await,
            InternalRoomState::WaitForReady { started } if started.contains(&user_id)
        )
    }

    pub async fn client_state(&self, user_id: i32, users: HashMap<i32, UserInfo>) -> ClientRoomState {
        ClientRoomState {
            id: self.id.clone(),
            state: self.client_room_state().await,
            live: self.is_live(),
            locked: self.is_locked(),
            cycle: self.cycle(),
            is_host: self.host_id().await == user_id,
            is_ready: self.is_ready(user_id).await,
            users,
        }
    }

    pub async fn on_state_change(&self) {
        let cmd = ServerCommand::ChangeState(self.client_room_state().await);
        self.broadcast(cmd).await;
    }

    pub async fn broadcast(&self, cmd: ServerCommand) {
        for id in self.member_ids().await {
            if let Some(user) = self.server.user(id).await {
                user.try_send(cmd.clone()).await;
            }
        }
    }

    /// Best-effort live telemetry forward: dropped outright if the room is
    /// no longer `Playing`, since a slow or stale burst must not stall it.
    pub async fn broadcast_monitors(&self, cmd: ServerCommand) {
        if !matches!(&*self.state.read().await, InternalRoomState::Playing { .. }) {
            return;
        }
        for id in self.monitor_ids().await {
            if let Some(user) = self.server.user(id).await {
                user.try_send(cmd.clone()).await;
            }
        }
    }

    pub async fn send(&self, msg: Message) {
        self.broadcast(ServerCommand::Message(msg)).await;
    }

    pub async fn check_host(&self, user_id: i32) -> Result<()> {
        if self.host_id().await != user_id {
            bail!(ROOM_ONLY_HOST);
        }
        Ok(())
    }

    /// Validate a prospective join before `add_user` mutates anything.
    pub async fn validate_join(&self, user_id: i32, monitor: bool, can_monitor: bool) -> Result<()> {
        if self.server.is_room_banned(&self.id, user_id).await {
            bail!(ROOM_BANNED);
        }
        if let Some(contest) = self.contest.read().await.as_ref() {
            if !contest.whitelist.contains(&user_id) {
                bail!(ROOM_NOT_WHITELISTED);
            }
        }
        if self.is_locked() {
            bail!(JOIN_ROOM_LOCKED);
        }
        if !matches!(*self.state.read().await, InternalRoomState::SelectChart) {
            bail!(JOIN_GAME_ONGOING);
        }
        if monitor && !can_monitor {
            bail!(JOIN_CANT_MONITOR);
        }
        Ok(())
    }

    /// Returns `false` (adding nobody) if player slots are full. Monitors
    /// never fill, and re-adding an id already present is a no-op.
    ///
    /// `live` is fixed at room creation (replay-eligible AND the global
    /// replay toggle at that time) and is not otherwise affected by who
    /// joins.
    pub async fn add_user(&self, user_id: i32, monitor: bool) -> bool {
        if monitor {
            let mut guard = self.monitors.write().await;
            if !guard.contains(&user_id) {
                guard.push(user_id);
            }
            true
        } else {
            let mut guard = self.users.write().await;
            if guard.contains(&user_id) {
                return true;
            }
            if guard.len() >= self.max_users.load(Ordering::SeqCst) {
                false
            } else {
                guard.push(user_id);
                true
            }
        }
    }

    /// Returns whether the room should now be recycled (no players left).
    #[must_use]
    pub async fn on_user_leave(&self, user_id: i32, name: &str) -> bool {
        self.send(Message::LeaveRoom {
            user: user_id,
            name: name.to_owned(),
        })
        .await;
        self.users.write().await.retain(|&it| it != user_id);
        self.monitors.write().await.retain(|&it| it != user_id);

        if self.host_id().await == user_id {
            let users = self.users.read().await.clone();
            if users.is_empty() {
                info!(room = self.id.to_string(), "room empty, dropping");
                return true;
            }
            // Deterministic migration: first remaining user, insertion order.
            let new_host = users[0];
            *self.host_id.write().await = new_host;
            if let Some(user) = self.server.user(new_host).await {
                self.send(Message::NewHost { user: new_host }).await;
                user.try_send(ServerCommand::ChangeHost(true)).await;
            }
        }
        self.check_all_ready().await;
        false
    }

    pub async fn select_chart(&self, user_id: i32, chart: Chart) -> Result<()> {
        self.check_host(user_id).await?;
        if !matches!(*self.state.read().await, InternalRoomState::SelectChart) {
            bail!(ROOM_INVALID_STATE);
        }
        self.send(Message::SelectChart {
            user: user_id,
            name: chart.name.clone(),
            id: chart.id,
        })
        .await;
        *self.chart.write().await = Some(chart);
        self.on_state_change().await;
        Ok(())
    }

    pub async fn request_start(&self, user_id: i32) -> Result<()> {
        self.check_host(user_id).await?;
        if !matches!(*self.state.read().await, InternalRoomState::SelectChart) {
            bail!(ROOM_INVALID_STATE);
        }
        if self.chart.read().await.is_none() {
            bail!(START_NO_CHART_SELECTED);
        }
        if let Some(user) = self.server.user(user_id).await {
            user.reset_game_time();
        }
        self.send(Message::GameStart { user: user_id }).await;
        *self.state.write().await = InternalRoomState::WaitForReady {
            started: std::iter::once(user_id).collect(),
        };
        self.on_state_change().await;
        self.check_all_ready().await;
        Ok(())
    }

    pub async fn ready(&self, user_id: i32) -> Result<()> {
        {
            let mut guard = self.state.write().await;
            let InternalRoomState::WaitForReady { started } = &mut *guard else {
                bail!(ROOM_INVALID_STATE);
            };
            if !started.insert(user_id) {
                bail!(ROOM_ALREADY_READY);
            }
        }
        self.send(Message::Ready { user: user_id }).await;
        self.check_all_ready().await;
        Ok(())
    }

    pub async fn cancel_ready(&self, user_id: i32) -> Result<()> {
        let is_host = {
            let mut guard = self.state.write().await;
            let InternalRoomState::WaitForReady { started } = &mut *guard else {
                bail!(ROOM_INVALID_STATE);
            };
            if !started.remove(&user_id) {
                bail!(ROOM_NOT_READY);
            }
            let is_host = self.host_id().await == user_id;
            if is_host {
                *guard = InternalRoomState::SelectChart;
            }
            is_host
        };
        if is_host {
            self.send(Message::CancelGame { user: user_id }).await;
            self.on_state_change().await;
        } else {
            self.send(Message::CancelReady { user: user_id }).await;
        }
        Ok(())
    }

    pub async fn played(&self, user_id: i32, record: Record) -> Result<()> {
        {
            let mut guard = self.state.write().await;
            let InternalRoomState::Playing { results, aborted } = &mut *guard else {
                bail!(ROOM_INVALID_STATE);
            };
            if aborted.contains(&user_id) {
                bail!(ROOM_GAME_ABORTED);
            }
            if results.iter().any(|(id, _)| *id == user_id) {
                bail!(RECORD_ALREADY_UPLOADED);
            }
            results.push((user_id, record.clone()));
        }
        self.send(Message::Played {
            user: user_id,
            score: record.score,
            accuracy: record.accuracy,
            full_combo: record.full_combo,
        })
        .await;
        self.check_all_ready().await;
        Ok(())
    }

    pub async fn abort(&self, user_id: i32) -> Result<()> {
        {
            let mut guard = self.state.write().await;
            let InternalRoomState::Playing { results, aborted } = &mut *guard else {
                bail!(ROOM_INVALID_STATE);
            };
            if results.iter().any(|(id, _)| *id == user_id) {
                bail!(RECORD_ALREADY_UPLOADED);
            }
            if !aborted.insert(user_id) {
                bail!(ROOM_GAME_ABORTED);
            }
        }
        self.send(Message::Abort { user: user_id }).await;
        self.check_all_ready().await;
        Ok(())
    }

    /// Advances `WaitForReady -> Playing` or `Playing -> SelectChart` if the
    /// room's membership now satisfies the current state's completion
    /// predicate. If settling finishes a contest marked `auto_disband`, the
    /// room disbands and deregisters itself as part of this call.
    pub async fn check_all_ready(&self) {
        enum Action {
            None,
            BeginPlaying,
            Settled,
        }

        let action = {
            let guard = self.state.read().await;
            match &*guard {
                InternalRoomState::WaitForReady { started } => {
                    let all_ready = {
                        let users = self.users.read().await;
                        let monitors = self.monitors.read().await;
                        users.iter().chain(monitors.iter()).all(|it| started.contains(it))
                    };
                    let manual = self
                        .contest
                        .read()
                        .await
                        .as_ref()
                        .map_or(false, |it| it.manual_start);
                    if all_ready && !manual {
                        Action::BeginPlaying
                    } else {
                        Action::None
                    }
                }
                InternalRoomState::Playing { results, aborted } => {
                    let users = self.users.read().await;
                    let done = users
                        .iter()
                        .all(|it| results.iter().any(|(id, _)| id == it) || aborted.contains(it));
                    if done {
                        Action::Settled
                    } else {
                        Action::None
                    }
                }
                InternalRoomState::SelectChart => Action::None,
            }
        };

        match action {
            Action::BeginPlaying => self.begin_playing().await,
            Action::Settled => {
                self.settle().await;
                if self.auto_disband().await {
                    self.disband().await;
                    self.server.remove_room(&self.id).await;
                }
            }
            Action::None => {}
        }
    }

    async fn begin_playing(&self) {
        info!(room = self.id.to_string(), "game start");
        self.send(Message::StartPlaying).await;
        *self.state.write().await = InternalRoomState::Playing {
            results: Vec::new(),
            aborted: HashSet::new(),
        };
        self.on_state_change().await;

        if self.replay_eligible && self.server.replay_enabled() {
            let chart_id = self.chart_id().await.unwrap_or(0);
            let user_ids = self.user_ids().await;
            self.server.replay.start_room(&self.id, chart_id, &user_ids).await;
        }
    }

    async fn settle(&self) {
        let results = {
            let mut guard = self.state.write().await;
            let InternalRoomState::Playing { results, .. } = std::mem::take(&mut *guard) else {
                unreachable!()
            };
            results
        };
        if let Some(summary) = settlement_summary(&results) {
            self.send(Message::Chat {
                user: 0,
                content: summary,
            })
            .await;
        }
        self.send(Message::GameEnd).await;
        *self.state.write().await = InternalRoomState::SelectChart;
        self.on_state_change().await;
        self.server.replay.end_room(&self.id).await;

        if self.cycle() {
            let users = self.users.read().await.clone();
            if !users.is_empty() {
                let current = self.host_id().await;
                if let Some(pos) = users.iter().position(|&it| it == current) {
                    let next = users[(pos + 1) % users.len()];
                    *self.host_id.write().await = next;
                    if let Some(user) = self.server.user(next).await {
                        self.send(Message::NewHost { user: next }).await;
                        user.try_send(ServerCommand::ChangeHost(true)).await;
                    }
                }
            }
        }
    }

    pub async fn auto_disband(&self) -> bool {
        self.contest
            .read()
            .await
            .as_ref()
            .map_or(false, |it| it.auto_disband)
    }

    /// Removes every player and monitor (each gets a `LeaveRoom` broadcast),
    /// leaving the room empty. The caller removes the room from the
    /// registry and ends any active replay recording.
    pub async fn disband(&self) {
        let members: Vec<i32> = self.member_ids().await;
        for id in &members {
            if let Some(user) = self.server.user(*id).await {
                self.send(Message::LeaveRoom {
                    user: *id,
                    name: user.name.clone(),
                })
                .await;
                *user.room.write().await = None;
            }
        }
        self.users.write().await.clear();
        self.monitors.write().await.clear();
    }

    // --- contest (admin) ---

    pub async fn set_contest(&self, manual_start: bool, auto_disband: bool, whitelist: Option<HashSet<i32>>) {
        let mut whitelist = whitelist.unwrap_or_default();
        whitelist.extend(self.member_ids().await);
        *self.contest.write().await = Some(Contest {
            whitelist,
            manual_start,
            auto_disband,
        });
    }

    pub async fn clear_contest(&self) {
        *self.contest.write().await = None;
    }

    /// Self-heals the whitelist by always including current members, so a
    /// whitelist update can never evict someone already in the room.
    pub async fn update_contest_whitelist(&self, ids: impl IntoIterator<Item = i32>) -> Result<()> {
        if !self.has_contest().await {
            bail!(ROOM_INVALID_STATE);
        }
        let mut whitelist: HashSet<i32> = ids.into_iter().collect();
        whitelist.extend(self.member_ids().await);
        if let Some(contest) = self.contest.write().await.as_mut() {
            contest.whitelist = whitelist;
        }
        Ok(())
    }

    pub async fn start_contest(&self, force: bool) -> Result<()> {
        if !matches!(*self.state.read().await, InternalRoomState::WaitForReady { .. }) {
            bail!(ROOM_INVALID_STATE);
        }
        if self.chart.read().await.is_none() {
            bail!(START_NO_CHART_SELECTED);
        }
        if !force {
            let guard = self.state.read().await;
            let InternalRoomState::WaitForReady { started } = &*guard else {
                unreachable!()
            };
            let all_ready = {
                let users = self.users.read().await;
                let monitors = self.monitors.read().await;
                users.iter().chain(monitors.iter()).all(|it| started.contains(it))
            };
            if !all_ready {
                bail!(ROOM_NOT_READY);
            }
        }
        self.begin_playing().await;
        Ok(())
    }
}

/// `bestScore = max(score)`, `bestAccuracy = max(accuracy)`,
/// `bestStd = min(std)`; ties keep the first occurrence in insertion order.
/// Returns `None` if there are no results to summarise.
fn settlement_summary(results: &[(i32, Record)]) -> Option<String> {
    let (_, first) = results.first()?;
    let mut best_score = first.score;
    let mut best_accuracy = first.accuracy;
    let mut best_std = first.std;
    for (_, record) in &results[1..] {
        if record.score > best_score {
            best_score = record.score;
        }
        if record.accuracy > best_accuracy {
            best_accuracy = record.accuracy;
        }
        if record.std < best_std {
            best_std = record.std;
        }
    }
    Some(format!(
        "best score: {best_score}, best accuracy: {:.2}%, best std: {}ms",
        best_accuracy * 100.0,
        (best_std * 1000.0).round() as i64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(score: i32, accuracy: f32, std: f32) -> Record {
        Record {
            id: 0,
            player: 0,
            score,
            perfect: 0,
            good: 0,
            bad: 0,
            miss: 0,
            max_combo: 0,
            accuracy,
            full_combo: false,
            std,
            std_score: 0.0,
        }
    }

    #[test]
    fn settlement_picks_max_score_max_accuracy_min_std_with_first_tie() {
        let results = vec![
            (1, record(100, 0.9, 0.020)),
            (2, record(150, 0.9, 0.010)),
            (3, record(150, 0.95, 0.030)),
        ];
        let summary = settlement_summary(&results).unwrap();
        assert!(summary.contains("150"));
        assert!(summary.contains("95.00%"));
        assert!(summary.contains("10ms"));
    }

    #[test]
    fn settlement_is_none_when_empty() {
        assert!(settlement_summary(&[]).is_none());
    }

    async fn test_server() -> Arc<ServerState> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = crate::Server::new(listener, crate::Config::default());
        Arc::clone(&server.state)
    }

    async fn register_room(server: &Arc<ServerState>, max_users: usize, host_id: i32) -> Arc<Room> {
        let room = Arc::new(Room::new(
            RoomId::try_from("room1".to_owned()).unwrap(),
            host_id,
            max_users,
            false,
            false,
            Arc::clone(server),
        ));
        server.rooms.write().await.insert(room.id.clone(), Arc::clone(&room));
        room
    }

    async fn register_user(server: &Arc<ServerState>, id: i32, name: &str) {
        server
            .users
            .write()
            .await
            .insert(id, Arc::new(crate::User::new(id, name.to_owned(), "en".to_owned())));
    }

    fn chart(id: i32) -> Chart {
        Chart { id, name: format!("chart-{id}") }
    }

    /// Mirrors spec.md §8 scenario 1: host selects a chart, requests start,
    /// the lone peer readies up, both settle back to `SelectChart`.
    #[tokio::test]
    async fn happy_path_select_ready_play_settle() {
        let server = test_server().await;
        register_user(&server, 100, "alice").await;
        register_user(&server, 200, "bob").await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(200, false).await;

        room.select_chart(100, chart(1)).await.unwrap();
        assert_eq!(room.chart_id().await, Some(1));

        room.request_start(100).await.unwrap();
        assert!(matches!(room.client_room_state().await, RoomState::WaitingForReady));

        room.ready(200).await.unwrap();
        assert!(matches!(room.client_room_state().await, RoomState::Playing));

        room.played(100, record(100, 0.9, 0.01)).await.unwrap();
        room.played(200, record(200, 0.95, 0.02)).await.unwrap();
        assert!(matches!(room.client_room_state().await, RoomState::SelectChart(_)));
    }

    /// spec.md §8 scenario 2: joining beyond `room_max_users` fails.
    #[tokio::test]
    async fn room_full_rejects_extra_player() {
        let server = test_server().await;
        let room = register_room(&server, 1, 100).await;
        assert!(!room.add_user(200, false).await);
        assert!(room.add_user(100, false).await, "re-adding the host id is idempotent");
    }

    /// Monitors count toward "all ready" (Design Notes §9 open question 2):
    /// a monitor who never readies blocks the automatic transition.
    #[tokio::test]
    async fn monitor_blocks_auto_start_until_ready() {
        let server = test_server().await;
        register_user(&server, 100, "alice").await;
        register_user(&server, 300, "carol").await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(300, true).await;

        room.select_chart(100, chart(1)).await.unwrap();
        room.request_start(100).await.unwrap();
        assert!(matches!(room.client_room_state().await, RoomState::WaitingForReady));

        room.ready(300).await.unwrap();
        assert!(matches!(room.client_room_state().await, RoomState::Playing));
    }

    /// Setting a contest always unions the whitelist with current members
    /// (invariant 7), even if the caller passed an empty/partial one, and
    /// a later whitelist replacement re-adds them again.
    #[tokio::test]
    async fn contest_whitelist_self_heals_with_current_members() {
        let server = test_server().await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(200, false).await;

        room.set_contest(false, false, Some(HashSet::new())).await;
        assert!(room.validate_join(100, false, false).await.is_ok());
        assert!(room.validate_join(200, false, false).await.is_ok());
        assert!(room.validate_join(300, false, false).await.is_err());

        room.update_contest_whitelist([999]).await.unwrap();
        assert!(room.validate_join(100, false, false).await.is_ok());
        assert!(room.validate_join(999, false, false).await.is_ok());
        assert!(room.validate_join(300, false, false).await.is_err());
    }

    #[tokio::test]
    async fn contest_rejects_non_whitelisted_join() {
        let server = test_server().await;
        let room = register_room(&server, 8, 100).await;
        room.set_contest(false, false, Some([100].into_iter().collect())).await;

        let err = room.validate_join(300, false, false).await.unwrap_err();
        assert_eq!(err.to_string(), ROOM_NOT_WHITELISTED);
        assert!(room.validate_join(100, false, false).await.is_ok());
    }

    /// Host migration picks the first remaining user in insertion order,
    /// not randomly (the deliberate REDESIGN FLAG divergence from the
    /// teacher's `rand::seq::SliceRandom::choose`).
    #[tokio::test]
    async fn host_migration_picks_first_remaining_in_insertion_order() {
        let server = test_server().await;
        register_user(&server, 200, "bob").await;
        register_user(&server, 300, "carol").await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(200, false).await;
        room.add_user(300, false).await;

        let recycle = room.on_user_leave(100, "alice").await;
        assert!(!recycle);
        assert_eq!(room.host_id().await, 200);
    }

    #[tokio::test]
    async fn empty_room_signals_recycle() {
        let server = test_server().await;
        let room = register_room(&server, 8, 100).await;
        assert!(room.on_user_leave(100, "alice").await);
    }

    /// `cycle` rotates the host to the next user after settlement.
    #[tokio::test]
    async fn cycle_rotates_host_after_settlement() {
        let server = test_server().await;
        register_user(&server, 100, "alice").await;
        register_user(&server, 200, "bob").await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(200, false).await;
        room.set_cycle(true);

        room.select_chart(100, chart(1)).await.unwrap();
        room.request_start(100).await.unwrap();
        room.ready(200).await.unwrap();
        room.played(100, record(100, 0.9, 0.01)).await.unwrap();
        room.played(200, record(100, 0.9, 0.01)).await.unwrap();

        assert_eq!(room.host_id().await, 200);
    }

    /// A contest's `auto_disband` triggers right after the settlement that
    /// finishes the last in-flight game (spec.md §8 scenario 5).
    #[tokio::test]
    async fn auto_disband_clears_room_after_settlement() {
        let server = test_server().await;
        register_user(&server, 100, "alice").await;
        register_user(&server, 200, "bob").await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(200, false).await;
        room.set_contest(false, true, None).await;

        room.select_chart(100, chart(1)).await.unwrap();
        room.request_start(100).await.unwrap();
        room.ready(200).await.unwrap();
        room.played(100, record(100, 0.9, 0.01)).await.unwrap();
        room.abort(200).await.unwrap();

        assert!(server.room(&room.id).await.is_none());
        assert!(room.user_ids().await.is_empty());
    }

    #[tokio::test]
    async fn select_chart_requires_host() {
        let server = test_server().await;
        let room = register_room(&server, 8, 100).await;
        room.add_user(200, false).await;
        let err = room.select_chart(200, chart(1)).await.unwrap_err();
        assert_eq!(err.to_string(), ROOM_ONLY_HOST);
    }
}
