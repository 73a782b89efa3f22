//! Structured access records.
//!
//! Every handshake and request produces one record: `connect`, `sendReq`,
//! or `sendReqNoReply`. Records flow through the [`AccessLog`] capability
//! so deployments can ship them wherever they aggregate traffic logs; the
//! default sink serialises them as JSON lines on the `gosoc::access` log
//! target.

use log::info;
use serde_json::{Map, Value};

/// One access event.
#[derive(Clone, Debug)]
pub struct AccessRecord {
    /// Request type for `sendReq` records; empty for `connect`.
    pub req_type: String,
    pub ip: String,
    pub uid: i64,
    /// Request parameters; long values are elided upstream.
    pub params: Value,
    /// Response status; absent for fire-and-forget requests.
    pub status: Option<u8>,
    pub message: String,
    /// Wall-clock processing time in seconds, pre-formatted to 3 decimals.
    pub duration: String,
    /// Application-supplied extra fields.
    pub extra: Vec<(String, Value)>,
}

impl AccessRecord {
    fn to_json(&self) -> String {
        let mut fields = Map::new();
        if !self.req_type.is_empty() {
            fields.insert("type".into(), Value::String(self.req_type.clone()));
        }
        fields.insert("ip".into(), Value::String(self.ip.clone()));
        fields.insert("uid".into(), Value::from(self.uid));
        fields.insert("params".into(), self.params.clone());
        if let Some(status) = self.status {
            fields.insert("status".into(), Value::from(status));
        }
        if !self.message.is_empty() {
            fields.insert("message".into(), Value::String(self.message.clone()));
        }
        fields.insert("duration".into(), Value::String(self.duration.clone()));
        for (key, value) in &self.extra {
            fields.insert(key.clone(), value.clone());
        }
        Value::Object(fields).to_string()
    }
}

/// Sink for access records.
pub trait AccessLog: Send + Sync {
    /// A handshake finished (accepted or not).
    fn connect(&self, record: &AccessRecord);
    /// A ReplyLater request was answered.
    fn send_req(&self, record: &AccessRecord);
    /// A NoReply request was handled.
    fn send_req_no_reply(&self, record: &AccessRecord);
}

/// Default sink: JSON lines on the `gosoc::access` log target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAccessLog;

impl AccessLog for LogAccessLog {
    fn connect(&self, record: &AccessRecord) {
        info!(target: "gosoc::access", "connect {}", record.to_json());
    }

    fn send_req(&self, record: &AccessRecord) {
        info!(target: "gosoc::access", "sendReq {}", record.to_json());
    }

    fn send_req_no_reply(&self, record: &AccessRecord) {
        info!(target: "gosoc::access", "sendReqNoReply {}", record.to_json());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_serialises_all_present_fields() {
        let record = AccessRecord {
            req_type: "chat.AddMessage".into(),
            ip: "10.0.0.9".into(),
            uid: 7,
            params: json!({ "message": "hi" }),
            status: Some(0),
            message: String::new(),
            duration: "0.003".into(),
            extra: vec![("device".into(), json!("ios"))],
        };
        let value: Value = serde_json::from_str(&record.to_json()).expect("valid JSON");
        assert_eq!(value["type"], "chat.AddMessage");
        assert_eq!(value["uid"], 7);
        assert_eq!(value["status"], 0);
        assert_eq!(value["device"], "ios");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn no_reply_record_omits_request_status() {
        let record = AccessRecord {
            req_type: "presence.Touch".into(),
            ip: "10.0.0.9".into(),
            uid: 7,
            params: json!("{}"),
            status: None,
            message: String::new(),
            duration: "0.120".into(),
            extra: Vec::new(),
        };
        let value: Value = serde_json::from_str(&record.to_json()).expect("valid JSON");
        assert!(value.get("status").is_none());
        assert!(value.get("message").is_none());
    }
}
