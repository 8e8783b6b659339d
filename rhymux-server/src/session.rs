use crate::{
    error::{
        err_to_str, AUTH_ACCOUNT_ALREADY_ONLINE, AUTH_BANNED, AUTH_INVALID_TOKEN,
        AUTH_REPEATED_AUTHENTICATE, CREATE_ID_OCCUPIED, JOIN_ROOM_FULL, RECORD_INVALID,
        ROOM_ALREADY_IN_ROOM, ROOM_CREATION_DISABLED, ROOM_NOT_FOUND, ROOM_NOT_IN_ROOM,
    },
    user::User,
    Room, ServerState,
};
use anyhow::{anyhow, bail, Result};
use rhymux_common::{
    BinaryData, ClientCommand, JoinRoomResponse, Message, RoomState, ServerCommand, Stream,
    HEARTBEAT_DISCONNECT_TIMEOUT,
};
use std::{
    collections::hash_map::Entry,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{oneshot, Mutex, Notify, OnceCell},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// How long a lost connection's room membership survives before the user
/// is evicted, distinct from the wire-facing [`HEARTBEAT_DISCONNECT_TIMEOUT`].
const DANGLE_WINDOW: Duration = Duration::from_secs(10);

pub struct Session {
    pub id: Uuid,
    pub stream: Stream<ServerCommand, ClientCommand>,
    pub user: Arc<User>,

    heartbeat_task: JoinHandle<()>,
}

impl Session {
    pub async fn new(id: Uuid, stream: TcpStream, server: Arc<ServerState>) -> Result<Arc<Self>> {
        let this = Arc::new(OnceCell::<Arc<Session>>::new());
        let this_inited = Arc::new(Notify::new());
        let (tx, rx) = oneshot::channel::<Arc<User>>();
        let last_recv: Arc<Mutex<Instant>> = Arc::new(Mutex::new(Instant::now()));

        let stream = Stream::<ServerCommand, ClientCommand>::new(
            stream,
            Box::new({
                let this = Arc::clone(&this);
                let this_inited = Arc::clone(&this_inited);
                let mut tx = Some(tx);
                let server = Arc::clone(&server);
                let last_recv = Arc::clone(&last_recv);
                let awaiting_auth = Arc::new(AtomicBool::new(true));
                let panicked = Arc::new(AtomicBool::new(false));
                move |send_tx, cmd| {
                    let this = Arc::clone(&this);
                    let this_inited = Arc::clone(&this_inited);
                    let tx = tx.take();
                    let server = Arc::clone(&server);
                    let last_recv = Arc::clone(&last_recv);
                    let awaiting_auth = Arc::clone(&awaiting_auth);
                    let panicked = Arc::clone(&panicked);
                    async move {
                        *last_recv.lock().await = Instant::now();
                        if panicked.load(Ordering::SeqCst) {
                            return;
                        }
                        if matches!(cmd, ClientCommand::Ping) {
                            let _ = send_tx.send(ServerCommand::Pong).await;
                            return;
                        }
                        if awaiting_auth.load(Ordering::SeqCst) {
                            let ClientCommand::Authenticate { token } = cmd else {
                                warn!("packet before authentication, ignoring: {cmd:?}");
                                return;
                            };
                            let Some(tx) = tx else { return };
                            let res: Result<()> = {
                                let this = Arc::clone(&this);
                                let server = Arc::clone(&server);
                                async move {
                                    let token = token.into_inner();
                                    if token.len() != 32 {
                                        bail!(AUTH_INVALID_TOKEN);
                                    }
                                    debug!("session {id}: authenticate {token}");
                                    let resp = server.identity.me(&token).await?;
                                    debug!("session {id} <- {resp:?}");

                                    if server.is_banned(resp.id).await {
                                        bail!(AUTH_BANNED);
                                    }

                                    let mut users_guard = server.users.write().await;
                                    let user = match users_guard.get(&resp.id) {
                                        Some(user) => {
                                            // A session can still be referenced while its
                                            // socket is already half-closed or dead; evict it
                                            // (its room seat is preserved, matching an
                                            // admin-initiated disconnect) rather than refusing
                                            // the new login.
                                            match user.session().await {
                                                Some(existing) if !existing.is_closed() => {
                                                    bail!(AUTH_ACCOUNT_ALREADY_ONLINE);
                                                }
                                                Some(stale) => {
                                                    warn!(
                                                        user = resp.id,
                                                        stale = %stale.id,
                                                        "evicting stale session on reconnect"
                                                    );
                                                    server.sessions.write().await.remove(&stale.id);
                                                    user.clear_session().await;
                                                }
                                                None => {}
                                            }
                                            info!(user = resp.id, "reconnect");
                                            Arc::clone(user)
                                        }
                                        None => {
                                            let user =
                                                Arc::new(User::new(resp.id, resp.name, resp.language));
                                            users_guard.insert(resp.id, Arc::clone(&user));
                                            user
                                        }
                                    };
                                    drop(users_guard);
                                    let _ = tx.send(Arc::clone(&user));
                                    this_inited.notified().await;
                                    user.set_session(Arc::downgrade(this.get().unwrap())).await;
                                    Ok(())
                                }
                            }
                            .await;
                            if let Err(err) = res {
                                warn!("failed to authenticate: {err:?}");
                                let _ = send_tx
                                    .send(ServerCommand::Authenticate(Err(err.to_string())))
                                    .await;
                                panicked.store(true, Ordering::SeqCst);
                                server.mark_lost(id).await;
                            } else {
                                let user = &this.get().unwrap().user;
                                let room_state = match user.room.read().await.clone() {
                                    Some(room_id) => match server.room(&room_id).await {
                                        Some(room) => {
                                            let members = server.room_member_infos(&room).await;
                                            Some(room.client_state(user.id, members).await)
                                        }
                                        None => None,
                                    },
                                    None => None,
                                };
                                let _ = send_tx
                                    .send(ServerCommand::Authenticate(Ok((user.to_info(), room_state))))
                                    .await;
                                awaiting_auth.store(false, Ordering::SeqCst);
                            }
                            return;
                        }

                        let user = this.get().map(|it| Arc::clone(&it.user)).unwrap();
                        if server.is_banned(user.id).await {
                            warn!(user = user.id, "{}", crate::error::USER_BANNED_BY_SERVER);
                            panicked.store(true, Ordering::SeqCst);
                            server.mark_lost(id).await;
                            return;
                        }
                        if let Some(resp) = process(user, cmd, Arc::clone(&server)).await {
                            if let Err(err) = send_tx.send(resp).await {
                                error!("failed to handle message, aborting connection {id}: {err:?}");
                                panicked.store(true, Ordering::SeqCst);
                                server.mark_lost(id).await;
                            }
                        }
                    }
                }
            }),
        )
        .await?;

        let heartbeat_task = tokio::spawn({
            let last_recv = Arc::clone(&last_recv);
            let server = Arc::clone(&server);
            async move {
                loop {
                    let recv = *last_recv.lock().await;
                    time::sleep_until(recv + HEARTBEAT_DISCONNECT_TIMEOUT).await;

                    if *last_recv.lock().await + HEARTBEAT_DISCONNECT_TIMEOUT > Instant::now() {
                        continue;
                    }
                    server.mark_lost(id).await;
                    break;
                }
            }
        });

        let user = rx.await?;

        let res = Arc::new(Self {
            id,
            stream,
            user,
            heartbeat_task,
        });
        let _ = this.set(Arc::clone(&res));
        this_inited.notify_one();
        Ok(res)
    }

    pub fn name(&self) -> &str {
        &self.user.name
    }

    /// True once the underlying socket has been observed half-closed or
    /// fully dead (a failed write, a closed/errored read), distinct from
    /// whether the `Session` value itself is still referenced.
    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub async fn try_send(&self, cmd: ServerCommand) {
        if let Err(err) = self.stream.send(cmd).await {
            error!("failed to deliver command to {}: {err:?}", self.id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
    }
}

/// Called once a session is confirmed lost (heartbeat timeout, decode
/// failure, or a panicked handler). `preserve` short-circuits the dangle
/// window entirely: admin-initiated disconnects want the room seat kept
/// regardless of how long the user takes to come back.
pub async fn handle_loss(user: Arc<User>, server: Arc<ServerState>, preserve: bool) {
    user.clear_session().await;
    let Some(room_id) = user.room.read().await.clone() else {
        server.users.write().await.remove(&user.id);
        return;
    };
    let Some(room) = server.room(&room_id).await else {
        server.users.write().await.remove(&user.id);
        return;
    };

    if preserve {
        return;
    }

    if matches!(room.client_room_state().await, RoomState::Playing) {
        warn!(user = user.id, "lost connection while playing, removing");
        server.users.write().await.remove(&user.id);
        if room.on_user_leave(user.id, &user.name).await {
            server.remove_room(&room.id).await;
        }
        return;
    }

    let token = user.mark_dangle();
    tokio::spawn(async move {
        time::sleep(DANGLE_WINDOW).await;
        if user.is_still_dangling(token).await {
            server.users.write().await.remove(&user.id);
            if room.on_user_leave(user.id, &user.name).await {
                server.remove_room(&room.id).await;
            }
        }
    });
}

async fn process(user: Arc<User>, cmd: ClientCommand, server: Arc<ServerState>) -> Option<ServerCommand> {
    macro_rules! get_room {
        ($d:ident) => {
            let room_id = user.room.read().await.clone();
            let Some(room_id) = room_id else {
                bail!(ROOM_NOT_IN_ROOM);
            };
            let $d = server.room(&room_id).await.ok_or_else(|| anyhow!(ROOM_NOT_FOUND))?;
        };
    }

    match cmd {
        ClientCommand::Ping => unreachable!(),
        ClientCommand::Authenticate { .. } => Some(ServerCommand::Authenticate(Err(
            AUTH_REPEATED_AUTHENTICATE.to_owned(),
        ))),
        ClientCommand::Chat { message } => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.send(Message::Chat {
                    user: user.id,
                    content: message.into_inner(),
                })
                .await;
                Ok(())
            }
            .await;
            Some(ServerCommand::Chat(err_to_str(res)))
        }
        ClientCommand::Touches { frames } => {
            let Some(room_id) = user.room.read().await.clone() else {
                return None;
            };
            let Some(room) = server.room(&room_id).await else {
                return None;
            };
            if room.is_live() {
                debug!("received {} touch events from {}", frames.len(), user.id);
                if let Some(frame) = frames.last() {
                    user.set_game_time(frame.time);
                }
                server
                    .replay
                    .write(
                        &room.id,
                        user.id,
                        encode_binary(&ClientCommand::Touches { frames: Arc::clone(&frames) }),
                    )
                    .await;
                tokio::spawn(async move {
                    room.broadcast_monitors(ServerCommand::Touches {
                        player: user.id,
                        frames,
                    })
                    .await;
                });
            } else {
                warn!("received touch events in non-live mode");
            }
            None
        }
        ClientCommand::Judges { judges } => {
            let Some(room_id) = user.room.read().await.clone() else {
                return None;
            };
            let Some(room) = server.room(&room_id).await else {
                return None;
            };
            if room.is_live() {
                debug!("received {} judge events from {}", judges.len(), user.id);
                server
                    .replay
                    .write(
                        &room.id,
                        user.id,
                        encode_binary(&ClientCommand::Judges { judges: Arc::clone(&judges) }),
                    )
                    .await;
                tokio::spawn(async move {
                    room.broadcast_monitors(ServerCommand::Judges {
                        player: user.id,
                        judges,
                    })
                    .await;
                });
            } else {
                warn!("received judge events in non-live mode");
            }
            None
        }
        ClientCommand::CreateRoom { id } => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                if user.room.read().await.is_some() {
                    bail!(ROOM_ALREADY_IN_ROOM);
                }
                if !server.room_creation_enabled() {
                    bail!(ROOM_CREATION_DISABLED);
                }
                // A room's replay-eligibility has no separate client-facing
                // flag today, so it tracks the server-wide toggle at the
                // moment of creation; `live` is fixed from that same value
                // per Design Notes and never re-derived afterwards.
                let replay_eligible = server.replay_enabled();
                let room = Arc::new(Room::new(
                    id.clone(),
                    user.id,
                    server.config.clamped_room_max_users(),
                    replay_eligible,
                    replay_eligible,
                    Arc::clone(&server),
                ));
                match server.rooms.write().await.entry(id.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(Arc::clone(&room));
                    }
                    Entry::Occupied(_) => bail!(CREATE_ID_OCCUPIED),
                }
                room.send(Message::CreateRoom { user: user.id }).await;
                *user.room.write().await = Some(id.clone());
                info!(user = user.id, room = id.to_string(), "user create room");
                Ok(())
            }
            .await;
            Some(ServerCommand::CreateRoom(err_to_str(res)))
        }
        ClientCommand::JoinRoom { id, monitor } => {
            let res: Result<JoinRoomResponse> = async {
                let _permit = server.command_lock.lock().await;
                if user.room.read().await.is_some() {
                    bail!(ROOM_ALREADY_IN_ROOM);
                }
                let Some(room) = server.room(&id).await else {
                    bail!(ROOM_NOT_FOUND);
                };
                room.validate_join(user.id, monitor, server.can_monitor(user.id))
                    .await?;
                if !room.add_user(user.id, monitor).await {
                    bail!(JOIN_ROOM_FULL);
                }
                info!(user = user.id, room = id.to_string(), monitor, "user join room");
                user.set_monitor(monitor);
                room.broadcast(ServerCommand::OnJoinRoom(user.to_info())).await;
                room.send(Message::JoinRoom {
                    user: user.id,
                    name: user.name.clone(),
                })
                .await;
                *user.room.write().await = Some(id.clone());
                let members = server.room_member_infos(&room).await;
                Ok(JoinRoomResponse {
                    state: room.client_room_state().await,
                    users: members.into_values().collect(),
                    live: room.is_live(),
                })
            }
            .await;
            Some(ServerCommand::JoinRoom(err_to_str(res)))
        }
        ClientCommand::LeaveRoom => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                info!(user = user.id, room = room.id.to_string(), "user leave room");
                *user.room.write().await = None;
                if room.on_user_leave(user.id, &user.name).await {
                    server.remove_room(&room.id).await;
                }
                Ok(())
            }
            .await;
            Some(ServerCommand::LeaveRoom(err_to_str(res)))
        }
        ClientCommand::LockRoom { lock } => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.check_host(user.id).await?;
                info!(user = user.id, room = room.id.to_string(), lock, "lock room");
                room.set_locked(lock);
                room.send(Message::LockRoom { lock }).await;
                Ok(())
            }
            .await;
            Some(ServerCommand::LockRoom(err_to_str(res)))
        }
        ClientCommand::CycleRoom { cycle } => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.check_host(user.id).await?;
                info!(user = user.id, room = room.id.to_string(), cycle, "cycle room");
                room.set_cycle(cycle);
                room.send(Message::CycleRoom { cycle }).await;
                Ok(())
            }
            .await;
            Some(ServerCommand::CycleRoom(err_to_str(res)))
        }
        ClientCommand::SelectChart { id } => {
            // The upstream chart fetch must not run under `command_lock`
            // (spec §5): validate host/room under the lock, release it for
            // the HTTP round-trip, then reacquire only to commit. If the
            // room state moved on underneath us meanwhile, `select_chart`
            // re-validates and simply rejects the stale attempt.
            let res: Result<()> = async {
                {
                    let _permit = server.command_lock.lock().await;
                    get_room!(room);
                    room.check_host(user.id).await?;
                }
                let span = debug_span!("select chart", user = user.id, chart = id);
                let chart = async {
                    trace!("fetch");
                    let chart = server.identity.chart(id).await?;
                    debug!("chart is {chart:?}");
                    Ok::<_, anyhow::Error>(chart)
                }
                .instrument(span)
                .await?;

                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.select_chart(user.id, chart).await
            }
            .await;
            Some(ServerCommand::SelectChart(err_to_str(res)))
        }
        ClientCommand::RequestStart => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.request_start(user.id).await
            }
            .await;
            Some(ServerCommand::RequestStart(err_to_str(res)))
        }
        ClientCommand::Ready => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.ready(user.id).await
            }
            .await;
            Some(ServerCommand::Ready(err_to_str(res)))
        }
        ClientCommand::CancelReady => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.cancel_ready(user.id).await
            }
            .await;
            Some(ServerCommand::CancelReady(err_to_str(res)))
        }
        ClientCommand::Played { id } => {
            // Same discipline as `SelectChart`: the upstream record fetch
            // and the replay-header patch are both I/O and must happen
            // outside `command_lock`; only the room mutation is taken under
            // it.
            let res: Result<()> = async {
                let room_id = {
                    let _permit = server.command_lock.lock().await;
                    get_room!(room);
                    room.id.clone()
                };
                let record = server.identity.record(id).await?;
                if record.player != user.id {
                    bail!(RECORD_INVALID);
                }
                debug!(room = room_id.to_string(), user = user.id, "user played: {record:?}");
                server.replay.set_record_id(&room_id, user.id, record.id).await;

                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.played(user.id, record).await
            }
            .await;
            Some(ServerCommand::Played(err_to_str(res)))
        }
        ClientCommand::Abort => {
            let res: Result<()> = async {
                let _permit = server.command_lock.lock().await;
                get_room!(room);
                room.abort(user.id).await
            }
            .await;
            Some(ServerCommand::Abort(err_to_str(res)))
        }
    }
}

fn encode_binary(val: &impl BinaryData) -> Vec<u8> {
    let mut buf = Vec::new();
    rhymux_common::encode_packet(val, &mut buf);
    buf
}
