//! Datachannel control messages.
//!
//! Every message is a tagged JSON record broadcast reliably and in order to
//! all participants of a room. Time-bearing messages carry `playout_ts` in
//! server-timeline milliseconds; routing must never re-encode that value.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    #[default]
    Crossfade,
    Cut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ImgPreload {
        id: String,
        cdn_url: String,
        playout_ts: i64,
        ttl_ms: u64,
    },
    ImgShow {
        id: String,
        playout_ts: i64,
        transition: Transition,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    EndChat,
    EndOfStream {
        session_id: String,
    },
    TimeTick {
        session_id: String,
        remaining_s: u64,
    },
}

impl ControlMessage {
    /// Server-timeline instant the message is bound to, when it has one.
    pub fn playout_ts(&self) -> Option<i64> {
        match self {
            Self::ImgPreload { playout_ts, .. } | Self::ImgShow { playout_ts, .. } => {
                Some(*playout_ts)
            }
            _ => None,
        }
    }

    pub fn to_json_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_the_wire_contract() {
        let preload = ControlMessage::ImgPreload {
            id: "parthenon".into(),
            cdn_url: "https://cdn.example/parthenon.jpg".into(),
            playout_ts: 1_700_000_000_123,
            ttl_ms: 30_000,
        };
        let value: serde_json::Value = serde_json::from_slice(&preload.to_json_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "img_preload");
        assert_eq!(value["playout_ts"], 1_700_000_000_123i64);

        let show = ControlMessage::ImgShow {
            id: "parthenon".into(),
            playout_ts: 42,
            transition: Transition::Crossfade,
            duration_ms: 400,
            caption: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&show.to_json_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "img_show");
        assert_eq!(value["transition"], "crossfade");
        assert!(value.get("caption").is_none());

        let tick = ControlMessage::TimeTick {
            session_id: "sess_1".into(),
            remaining_s: 120,
        };
        let value: serde_json::Value = serde_json::from_slice(&tick.to_json_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "time_tick");
    }

    #[test]
    fn playout_ts_survives_a_round_trip_unchanged() {
        let msg = ControlMessage::ImgShow {
            id: "x".into(),
            playout_ts: i64::MAX - 7,
            transition: Transition::Cut,
            duration_ms: 400,
            caption: Some("The Parthenon at dusk".into()),
        };
        let decoded = ControlMessage::from_json_bytes(&msg.to_json_bytes().unwrap()).unwrap();
        assert_eq!(decoded.playout_ts(), Some(i64::MAX - 7));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn untimed_messages_report_no_playout_ts() {
        assert_eq!(ControlMessage::EndChat.playout_ts(), None);
        let eos = ControlMessage::EndOfStream {
            session_id: "sess_1".into(),
        };
        assert_eq!(eos.playout_ts(), None);
    }
}
