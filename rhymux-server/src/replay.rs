use rhymux_common::RoomId;
use std::{
    collections::HashMap,
    io::SeekFrom,
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::warn;

const MAGIC: u16 = 0x504d;
const HEADER_LEN: u64 = 14;
const FILE_EXT: &str = "phirarec";

enum StreamCmd {
    Frame(Vec<u8>),
    SetRecordId(u32),
}

struct StreamHandle {
    tx: mpsc::Sender<StreamCmd>,
    task: JoinHandle<()>,
}

/// Replay recording bound to a single room's lifecycle: one append-only
/// file per player, opened at game start and closed at settlement or
/// disband. Writes are serialised FIFO per stream by a dedicated writer
/// task; every failure here is swallowed — recording must never affect
/// gameplay.
pub struct ReplayRecorder {
    base_dir: PathBuf,
    rooms: Mutex<HashMap<RoomId, HashMap<i32, StreamHandle>>>,
}

impl ReplayRecorder {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent per room while active: calling this again for a room
    /// that's already recording is a no-op.
    pub async fn start_room(&self, room_id: &RoomId, chart_id: i32, user_ids: &[i32]) {
        let mut rooms = self.rooms.lock().await;
        if rooms.contains_key(room_id) {
            return;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut streams = HashMap::new();
        for &user_id in user_ids {
            let dir = self
                .base_dir
                .join(user_id.to_string())
                .join(chart_id.to_string());
            let path = dir.join(format!("{now_ms}.{FILE_EXT}"));
            let (tx, rx) = mpsc::channel(256);
            let task = tokio::spawn(writer_task(dir, path, chart_id, user_id, rx));
            streams.insert(user_id, StreamHandle { tx, task });
        }
        rooms.insert(room_id.clone(), streams);
    }

    /// Enqueue an encoded `Touches`/`Judges` client-command payload for one
    /// player's stream. A missing stream (recording disabled, or the room
    /// isn't recording) is silently ignored.
    pub async fn write(&self, room_id: &RoomId, user_id: i32, payload: Vec<u8>) {
        let rooms = self.rooms.lock().await;
        if let Some(stream) = rooms.get(room_id).and_then(|it| it.get(&user_id)) {
            if stream.tx.send(StreamCmd::Frame(payload)).await.is_err() {
                warn!("replay stream for {room_id}/{user_id} is gone");
            }
        }
    }

    /// Patch the previously-unknown record id into a player's header once
    /// the upload has returned one.
    pub async fn set_record_id(&self, room_id: &RoomId, user_id: i32, record_id: i32) {
        let rooms = self.rooms.lock().await;
        if let Some(stream) = rooms.get(room_id).and_then(|it| it.get(&user_id)) {
            let _ = stream
                .tx
                .send(StreamCmd::SetRecordId(record_id as u32))
                .await;
        }
    }

    pub async fn end_room(&self, room_id: &RoomId) {
        if let Some(streams) = self.rooms.lock().await.remove(room_id) {
            for (_, stream) in streams {
                // Drop the sender so the writer's `rx.recv()` loop sees the
                // channel close, then wait for it to drain and return —
                // aborting here would race a `SetRecordId` enqueued just
                // before `end_room` (the Played -> settle -> end_room path
                // has no delay between them) against the patch actually
                // landing on disk.
                drop(stream.tx);
                let _ = stream.task.await;
            }
        }
    }
}

async fn writer_task(
    dir: PathBuf,
    path: PathBuf,
    chart_id: i32,
    user_id: i32,
    mut rx: mpsc::Receiver<StreamCmd>,
) {
    let file = async {
        fs::create_dir_all(&dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&MAGIC.to_le_bytes());
        header.extend_from_slice(&(chart_id as u32).to_le_bytes());
        header.extend_from_slice(&(user_id as u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        file.write_all(&header).await?;
        Ok::<_, std::io::Error>(file)
    }
    .await;
    let mut file = match file {
        Ok(file) => file,
        Err(err) => {
            warn!("replay recording disabled for {path:?}: {err:?}");
            // Drain the channel so senders don't block forever on a dead stream.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(cmd) = rx.recv().await {
        let result: std::io::Result<()> = async {
            match cmd {
                StreamCmd::Frame(payload) => {
                    file.write_u32_le(payload.len() as u32).await?;
                    file.write_all(&payload).await?;
                }
                StreamCmd::SetRecordId(record_id) => {
                    let pos = file.stream_position().await?;
                    file.seek(SeekFrom::Start(10)).await?;
                    file.write_all(&record_id.to_le_bytes()).await?;
                    file.seek(SeekFrom::Start(pos)).await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!("replay write failed for {path:?}: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_bytes_match_scenario() {
        let dir = std::env::temp_dir().join(format!("rhymux-replay-test-{}", uuid::Uuid::new_v4()));
        let recorder = ReplayRecorder::new(dir.clone());
        let room_id: RoomId = "room1".to_owned().try_into().unwrap();
        recorder.start_room(&room_id, 1, &[100]).await;
        // give the writer task a chance to create the file
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        recorder.end_room(&room_id).await;

        let chart_dir = dir.join("100").join("1");
        let mut entries = fs::read_dir(&chart_dir).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        let bytes = fs::read(entry.path()).await.unwrap();
        assert_eq!(&bytes[0..2], &[0x4d, 0x50]);
        assert_eq!(&bytes[2..6], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[6..10], &[0x64, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[10..14], &[0x00, 0x00, 0x00, 0x00]);

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn set_record_id_patches_header_in_place() {
        let dir = std::env::temp_dir().join(format!("rhymux-replay-test-{}", uuid::Uuid::new_v4()));
        let recorder = ReplayRecorder::new(dir.clone());
        let room_id: RoomId = "room1".to_owned().try_into().unwrap();
        recorder.start_room(&room_id, 1, &[100]).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        recorder.set_record_id(&room_id, 100, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        recorder.end_room(&room_id).await;

        let chart_dir = dir.join("100").join("1");
        let mut entries = fs::read_dir(&chart_dir).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        let bytes = fs::read(entry.path()).await.unwrap();
        assert_eq!(&bytes[10..14], &[0x01, 0x00, 0x00, 0x00]);

        let _ = fs::remove_dir_all(&dir).await;
    }
}
