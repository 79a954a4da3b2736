//! Wire events exchanged with reporters and clients.
//!
//! Every frame is a JSON envelope `{"e": <name>, "d": <data>}`, decoded
//! into these tagged enums at a single dispatch point per connection.

use crate::report::{CanonicalReport, RawReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Events the gateway accepts from connected sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "e", content = "d")]
pub enum InboundEvent {
    #[serde(rename = "report")]
    Report(Box<RawReport>),
    #[serde(rename = "heartbeatResponse")]
    HeartbeatResponse { uuid: String, epoch: u64 },
    #[serde(rename = "speedtest")]
    Speedtest(serde_json::Value),
    #[serde(rename = "staticData")]
    StaticData(StaticData),
    #[serde(rename = "dynamicData")]
    DynamicData(serde_json::Value),
    #[serde(rename = "getMachines")]
    GetMachines,
    #[serde(rename = "getPoints")]
    GetPoints,
    #[serde(rename = "newTerminalConnection")]
    NewTerminalConnection { uuid: String },
    #[serde(rename = "input")]
    Input { uuid: String, data: String },
    #[serde(rename = "terminateTerminal")]
    TerminateTerminal { uuid: String },
}

/// Machine descriptor a reporter announces once per connection. The
/// machine identity comes from the session handshake, never from here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StaticData {
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub owner: Option<String>,
}

/// Events the gateway emits to sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "e", content = "d")]
pub enum OutboundEvent {
    /// Epoch milliseconds; reporters echo it back for latency measurement.
    #[serde(rename = "heartbeat")]
    Heartbeat(u64),
    #[serde(rename = "machines")]
    Machines(HashMap<String, CanonicalReport>),
    #[serde(rename = "runSpeedtest")]
    RunSpeedtest,
    #[serde(rename = "points")]
    Points(i64),
    #[serde(rename = "startTerminal")]
    StartTerminal { uuid: String },
    #[serde(rename = "terminateTerminal")]
    TerminateTerminal { uuid: String },
    #[serde(rename = "input")]
    Input { uuid: String, data: String },
    /// Live metrics fan-out to the client room, tagged with the
    /// originating machine so dashboards can filter.
    #[serde(rename = "dynamicData")]
    DynamicData { uuid: String, data: serde_json::Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_envelope_decoding() {
        let ev: InboundEvent =
            serde_json::from_str(r#"{"e":"heartbeatResponse","d":{"uuid":"abc","epoch":12345}}"#)
                .unwrap();
        assert!(matches!(ev, InboundEvent::HeartbeatResponse { epoch: 12345, .. }));

        let ev: InboundEvent = serde_json::from_str(r#"{"e":"getMachines"}"#).unwrap();
        assert!(matches!(ev, InboundEvent::GetMachines));

        let ev: InboundEvent =
            serde_json::from_str(r#"{"e":"report","d":{"uuid":"abc","cpu":12}}"#).unwrap();
        assert!(matches!(ev, InboundEvent::Report(_)));
    }

    #[test]
    fn test_unknown_event_is_an_error_not_a_panic() {
        assert!(serde_json::from_str::<InboundEvent>(r#"{"e":"selfDestruct"}"#).is_err());
    }

    #[test]
    fn test_outbound_envelope_encoding() {
        let json = serde_json::to_string(&OutboundEvent::Heartbeat(1700000000000)).unwrap();
        assert_eq!(json, r#"{"e":"heartbeat","d":1700000000000}"#);

        let json = serde_json::to_string(&OutboundEvent::RunSpeedtest).unwrap();
        assert_eq!(json, r#"{"e":"runSpeedtest"}"#);

        let json = serde_json::to_string(&OutboundEvent::DynamicData {
            uuid: "abc".into(),
            data: serde_json::json!({ "processes": 132 }),
        })
        .unwrap();
        assert_eq!(json, r#"{"e":"dynamicData","d":{"uuid":"abc","data":{"processes":132}}}"#);
    }

    #[test]
    fn test_static_data_ignores_extraneous_identity_fields() {
        // reporters may still send uuid/version in the descriptor; the
        // session handshake is the only identity source
        let ev: InboundEvent = serde_json::from_str(
            r#"{"e":"staticData","d":{"uuid":"abc","hostname":"host-a","owner":"user-1","reporterVersion":"0.23"}}"#,
        )
        .unwrap();
        let InboundEvent::StaticData(data) = ev else { panic!("wrong variant") };
        assert_eq!(data.hostname.as_deref(), Some("host-a"));
        assert_eq!(data.owner.as_deref(), Some("user-1"));
    }
}
