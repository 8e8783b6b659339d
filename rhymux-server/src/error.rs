//! Stable wire error codes (spec §7). Handlers `bail!` these directly;
//! `err_to_str` turns the resulting `anyhow::Error` into the wire string at
//! the point a `ServerCommand` response is built, exactly like the
//! original's locale lookup did before localisation was pulled out of the
//! core's scope.

// Validation
pub const CREATE_ID_OCCUPIED: &str = "create-id-occupied";
pub const JOIN_ROOM_FULL: &str = "join-room-full";
pub const JOIN_ROOM_LOCKED: &str = "join-room-locked";
pub const JOIN_GAME_ONGOING: &str = "join-game-ongoing";
pub const JOIN_CANT_MONITOR: &str = "join-cant-monitor";
pub const ROOM_ALREADY_IN_ROOM: &str = "room-already-in-room";
pub const ROOM_NOT_IN_ROOM: &str = "room-not-in-room";
pub const ROOM_NOT_FOUND: &str = "room-not-found";
pub const ROOM_CREATION_DISABLED: &str = "room-creation-disabled";
pub const ROOM_BANNED: &str = "room-banned";
pub const ROOM_NOT_WHITELISTED: &str = "room-not-whitelisted";
pub const ROOM_ONLY_HOST: &str = "room-only-host";
pub const ROOM_INVALID_STATE: &str = "room-invalid-state";
pub const ROOM_ALREADY_READY: &str = "room-already-ready";
pub const ROOM_NOT_READY: &str = "room-not-ready";
pub const ROOM_GAME_ABORTED: &str = "room-game-aborted";
pub const START_NO_CHART_SELECTED: &str = "start-no-chart-selected";
pub const RECORD_INVALID: &str = "record-invalid";
pub const RECORD_ALREADY_UPLOADED: &str = "record-already-uploaded";

// External
pub const AUTH_FETCH_ME_FAILED: &str = "auth-fetch-me-failed";
pub const AUTH_INVALID_TOKEN: &str = "auth-invalid-token";
pub const CHART_FETCH_FAILED: &str = "chart-fetch-failed";
pub const RECORD_FETCH_FAILED: &str = "record-fetch-failed";
pub const NET_REQUEST_TIMEOUT: &str = "net-request-timeout";

// Auth
pub const AUTH_ACCOUNT_ALREADY_ONLINE: &str = "auth-account-already-online";
pub const AUTH_REPEATED_AUTHENTICATE: &str = "auth-repeated-authenticate";
pub const AUTH_BANNED: &str = "auth-banned";
pub const USER_BANNED_BY_SERVER: &str = "user-banned-by-server";

/// Collapse an internal `anyhow::Result` into the wire `Result<T, String>`
/// shape at the point a response is built.
#[inline]
pub fn err_to_str<T>(result: anyhow::Result<T>) -> Result<T, String> {
    result.map_err(|it| it.to_string())
}
