/// Protobuf payload of `INTERACT_WORD_V2` events, carried base64-encoded in
/// `data.pb`. Only the fields the client reads are declared; prost skips the rest.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InteractWordV2 {
    #[prost(int64, tag = "1")]
    pub uid: i64,
    #[prost(string, tag = "2")]
    pub uname: String,
    /// 1 = enter, 2 = follow, 3 = share.
    #[prost(int64, tag = "5")]
    pub msg_type: i64,
    #[prost(int64, tag = "6")]
    pub roomid: i64,
    #[prost(int64, tag = "7")]
    pub timestamp: i64,
}

pub const INTERACT_ENTER: i64 = 1;
