//! Wire envelopes: the command message placed on `<domain>__commands`
//! queues and the reply message placed on reply queues.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// The message body enqueued for each command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub domain: String,
    pub command_type: String,
    pub command_id: Uuid,
    pub correlation_id: Uuid,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl CommandEnvelope {
    /// Parse a raw queue payload. Failure marks the message as poison; the
    /// worker archives it without touching command state.
    pub fn from_value(value: &Value) -> Result<Self, RelayError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<Value, RelayError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Terminal outcome carried on a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyOutcome {
    Success,
    Canceled,
    Failed,
}

impl ReplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyOutcome {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "CANCELED" => Ok(Self::Canceled),
            "FAILED" => Ok(Self::Failed),
            other => Err(RelayError::decode(format!(
                "unknown reply outcome '{other}'"
            ))),
        }
    }
}

/// The message body written to a reply queue on a terminal transition of a
/// command whose reply_to is set: worker completion, operator cancel and
/// operator complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub command_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub outcome: ReplyOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReplyEnvelope {
    pub fn success(command_id: Uuid, correlation_id: Option<Uuid>, result: Option<Value>) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Success,
            result,
            reason: None,
        }
    }

    pub fn canceled(
        command_id: Uuid,
        correlation_id: Option<Uuid>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Canceled,
            result: None,
            reason: Some(reason.into()),
        }
    }

    pub fn failed(
        command_id: Uuid,
        correlation_id: Option<Uuid>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Failed,
            result: None,
            reason: Some(reason.into()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, RelayError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<Value, RelayError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_envelope_round_trip() {
        let envelope = CommandEnvelope {
            domain: "payments".to_string(),
            command_type: "DebitAccount".to_string(),
            command_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            data: json!({"acct": "A", "amt": 100}),
            reply_to: Some("payments__replies".to_string()),
        };

        let value = envelope.to_value().unwrap();
        let parsed = CommandEnvelope::from_value(&value).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_command_envelope_omits_null_reply_to() {
        let envelope = CommandEnvelope {
            domain: "payments".to_string(),
            command_type: "DebitAccount".to_string(),
            command_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            data: json!({}),
            reply_to: None,
        };

        let value = envelope.to_value().unwrap();
        assert!(value.get("reply_to").is_none());
    }

    #[test]
    fn test_command_envelope_missing_command_id_is_poison() {
        let value = json!({
            "domain": "payments",
            "command_type": "DebitAccount",
            "data": {},
        });
        assert!(CommandEnvelope::from_value(&value).is_err());
    }

    #[test]
    fn test_reply_envelope_success_shape() {
        let command_id = Uuid::new_v4();
        let reply = ReplyEnvelope::success(command_id, None, Some(json!({"ok": true})));
        let value = reply.to_value().unwrap();

        assert_eq!(value["outcome"], "SUCCESS");
        assert_eq!(value["result"]["ok"], true);
        assert!(value.get("reason").is_none());
        assert!(value.get("correlation_id").is_none());
    }

    #[test]
    fn test_reply_envelope_canceled_carries_reason() {
        let reply = ReplyEnvelope::canceled(Uuid::new_v4(), Some(Uuid::new_v4()), "operator said no");
        let value = reply.to_value().unwrap();

        assert_eq!(value["outcome"], "CANCELED");
        assert_eq!(value["reason"], "operator said no");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_reply_outcome_parse() {
        assert_eq!("SUCCESS".parse::<ReplyOutcome>().unwrap(), ReplyOutcome::Success);
        assert!("MAYBE".parse::<ReplyOutcome>().is_err());
    }
}
