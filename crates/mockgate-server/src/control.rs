use mockgate_core::{ProtocolViolation, RequestId};
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_STATUS_CODE: u16 = 200;

/// Inbound frame from an operator console, before validation.
#[derive(Debug, Deserialize)]
struct RawControlMessage {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    status_code: Option<Value>,
    response: Option<Value>,
}

/// A validated operator instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    SendResponse {
        id: RequestId,
        status_code: u16,
        response: Value,
    },
}

pub fn parse_control_message(raw: &str) -> Result<ControlMessage, ProtocolViolation> {
    let msg: RawControlMessage =
        serde_json::from_str(raw).map_err(|e| ProtocolViolation::Malformed(e.to_string()))?;

    match msg.kind.as_str() {
        "send_response" => {
            let id = msg
                .id
                .ok_or_else(|| ProtocolViolation::Malformed("missing id".into()))?;
            let response = msg
                .response
                .ok_or_else(|| ProtocolViolation::Malformed("missing response".into()))?;
            let status_code = match msg.status_code {
                None | Some(Value::Null) => DEFAULT_STATUS_CODE,
                Some(value) => parse_status(&value)?,
            };
            Ok(ControlMessage::SendResponse {
                id: RequestId::from_raw(id),
                status_code,
                response,
            })
        }
        other => Err(ProtocolViolation::UnknownType(other.to_string())),
    }
}

fn parse_status(value: &Value) -> Result<u16, ProtocolViolation> {
    let code = value.as_u64().ok_or_else(|| {
        ProtocolViolation::Malformed(format!("status_code must be an integer, got {value}"))
    })?;
    if (100..=999).contains(&code) {
        Ok(code as u16)
    } else {
        Err(ProtocolViolation::InvalidStatus(code))
    }
}
