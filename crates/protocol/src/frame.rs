//! Wire & Frame Codec (spec §4.A).
//!
//! The envelope's `type` tag is shared between the client→server and
//! server→client directions, but `"hello"` carries a different payload
//! shape in each direction (a handshake request vs. a `HelloOk` snapshot),
//! so client-originated and server-originated frames are modeled as two
//! separate tagged enums rather than one, matching §6's own split.

use cb_domain::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ChatUi,
    Node,
    Cli,
}

/// Client → server: `hello`, `rpc.req`, nodes reporting results as
/// `event`, and a client-detected `seqGap` (spec §4.H: the hub answers by
/// resending `push.snapshot` rather than a partial replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "hello")]
    Hello(HelloRequest),
    #[serde(rename = "rpc.req")]
    RpcReq(RpcReq),
    #[serde(rename = "event")]
    Event(EventFrame),
    #[serde(rename = "seqGap")]
    SeqGap(SeqGapFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub role: Role,
    pub client_name: String,
    pub client_version: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReq {
    pub id: String,
    pub method: String,
    #[serde(default = "default_null_value")]
    pub params: Value,
}

fn default_null_value() -> Value {
    Value::Null
}

/// Server → client: `hello.ok` (tagged `"hello"`, see module docs),
/// `rpc.res`, `event`, `push.snapshot`, `seqGap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "hello")]
    HelloOk(HelloOk),
    #[serde(rename = "rpc.res")]
    RpcRes(RpcRes),
    #[serde(rename = "event")]
    Event(EventFrame),
    #[serde(rename = "push.snapshot")]
    PushSnapshot(PushSnapshot),
    #[serde(rename = "seqGap")]
    SeqGap(SeqGapFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRes {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub code: String,
    pub message: String,
}

impl RpcRes {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(RpcErrorPayload {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqGapFrame {
    pub expected: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVersionPair {
    pub presence: u64,
    pub health: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub presence: Vec<String>,
    pub health: Value,
    pub state_version: StateVersionPair,
    pub uptime_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_defaults: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    #[serde(rename = "_protocol")]
    pub protocol: u32,
    pub server: Value,
    pub features: Value,
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_host_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    pub policy: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSnapshot {
    pub snapshot: Snapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trips() {
        let frame = ClientFrame::Hello(HelloRequest {
            role: Role::ChatUi,
            client_name: "web".into(),
            client_version: "1.0".into(),
            platform: None,
            mode: None,
            instance_id: None,
            scopes: vec![],
            commands: None,
            token: Some("tok".into()),
            password: None,
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"hello\""));
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        match back {
            ClientFrame::Hello(h) => assert_eq!(h.client_name, "web"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rpc_res_omits_absent_payload_and_error() {
        let res = RpcRes::ok("1", Value::Bool(true));
        let json = serde_json::to_value(ServerFrame::RpcRes(res)).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("payload").is_some());
    }

    #[test]
    fn seq_gap_round_trips() {
        let frame = ServerFrame::SeqGap(SeqGapFrame {
            expected: 5,
            received: 7,
        });
        let json = serde_json::to_string(&frame).unwrap();
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        match back {
            ServerFrame::SeqGap(g) => {
                assert_eq!(g.expected, 5);
                assert_eq!(g.received, 7);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_seq_gap_round_trips() {
        let frame = ClientFrame::SeqGap(SeqGapFrame {
            expected: 4,
            received: 9,
        });
        let json = serde_json::to_string(&frame).unwrap();
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        match back {
            ClientFrame::SeqGap(g) => {
                assert_eq!(g.expected, 4);
                assert_eq!(g.received, 9);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_tag_fails_to_parse() {
        let raw = serde_json::json!({ "type": "bogus" });
        let res: Result<ServerFrame, _> = serde_json::from_value(raw);
        assert!(res.is_err());
    }
}
