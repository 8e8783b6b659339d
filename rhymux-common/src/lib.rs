mod bin;
pub use bin::*;

mod command;
pub use command::*;

mod stream;
pub use stream::*;

use anyhow::Result;
use std::time::Duration;

/// Protocol version this build speaks. The handshake closes the connection
/// on any mismatch before a single application byte is read.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames larger than this are rejected with `frame-payload-too-large`
/// before the payload bytes are even read off the socket.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);
pub const HEARTBEAT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn encode_packet(payload: &impl BinaryData, vec: &mut Vec<u8>) {
    BinaryWriter::new(vec).write(payload).unwrap();
}

pub fn decode_packet<T>(data: &[u8]) -> Result<T>
where
    T: BinaryData,
{
    BinaryReader::new(data).read()
}
