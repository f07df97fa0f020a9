//! Client -> server messages.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a request, starting a new turn.
    Chat {
        message: String,
        /// Stored conversation to continue. Only honoured on the first chat.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },

    /// Cancel the turn in progress.
    Cancel,

    /// Keepalive. Answered out of band with `pong`.
    Ping,
}

impl ClientMessage {
    /// Decode and validate a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: ClientMessage = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Check field-level constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Chat { message, conversation_id } => {
                if message.trim().is_empty() {
                    return Err(ProtocolError::EmptyChat);
                }
                if let Some(id) = conversation_id
                    && id.trim().is_empty()
                {
                    return Err(ProtocolError::Malformed(
                        "conversation_id must not be blank".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Cancel | Self::Ping => Ok(()),
        }
    }

    /// The `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Cancel => "cancel",
            Self::Ping => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat() {
        let msg = ClientMessage::parse(r#"{"type":"chat","message":"BTC price?"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Chat {
                message: "BTC price?".to_string(),
                conversation_id: None,
            }
        );
    }

    #[test]
    fn test_parse_chat_with_conversation() {
        let msg = ClientMessage::parse(
            r#"{"type":"chat","message":"hi","conversation_id":"conv-1"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Chat { conversation_id, .. } => {
                assert_eq!(conversation_id.as_deref(), Some("conv-1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unit_variants() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"cancel"}"#).unwrap(),
            ClientMessage::Cancel
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"launch"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"chat"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_empty_chat() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"chat","message":"   "}"#),
            Err(ProtocolError::EmptyChat)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"chat","message":"x","conversation_id":""}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
