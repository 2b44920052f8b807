pub mod cascade;
pub mod event;
pub mod frame;
mod proto;
mod session;
mod subscribers;

use std::time::Duration;

use serde::Serialize;

pub use session::Session;
pub use subscribers::Subscribers;

pub const DEFAULT_ENDPOINT: &str = "wss://broadcastlv.chat.bilibili.com/sub";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity handed to the chat service in the auth frame. The token comes
/// from the room's danmu-info lookup, which happens outside this crate.
#[derive(Debug, Clone)]
pub struct LiveCredentials {
    pub uid: u64,
    pub room_id: u64,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// JSON body of the opcode-7 auth frame.
#[derive(Serialize)]
struct AuthPayload<'a> {
    uid: u64,
    roomid: u64,
    protover: u16,
    platform: &'a str,
    r#type: u8,
    key: &'a str,
}

impl<'a> AuthPayload<'a> {
    fn new(credentials: &'a LiveCredentials) -> Self {
        Self {
            uid: credentials.uid,
            roomid: credentials.room_id,
            protover: frame::version::BROTLI,
            platform: "web",
            r#type: 2,
            key: &credentials.token,
        }
    }
}
