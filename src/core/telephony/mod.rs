//! Telephony media channel.
//!
//! Messages follow the Twilio Media Streams JSON protocol: the carrier sends
//! `connected`, `start`, `media`, `mark`, `dtmf` and `stop`; the bridge
//! answers with `media`, `clear` and `mark`. Terminating the call is closing
//! the stream.

mod messages;

pub use messages::{
    InboundMessage, MarkPayload, MediaPayload, OutboundMessage, OutboundMedia, StartPayload,
};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use super::codec::{CodecError, CodecResult};

/// What the bridge asks the telephony writer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyCommand {
    /// One 20ms μ-law frame for the caller.
    Media(Bytes),
    /// Drop any audio the endpoint has buffered.
    Clear,
    /// Named marker echoed back once preceding audio has played.
    Mark(String),
    /// Terminate the call.
    Hangup,
}

impl TelephonyCommand {
    /// Encode for the wire. `Hangup` has no message; the writer closes the
    /// socket instead.
    pub fn to_message(&self, stream_sid: &str) -> Option<OutboundMessage> {
        match self {
            Self::Media(frame) => Some(OutboundMessage::Media {
                stream_sid: stream_sid.to_string(),
                media: OutboundMedia {
                    payload: BASE64.encode(frame),
                },
            }),
            Self::Clear => Some(OutboundMessage::Clear {
                stream_sid: stream_sid.to_string(),
            }),
            Self::Mark(name) => Some(OutboundMessage::Mark {
                stream_sid: stream_sid.to_string(),
                mark: MarkPayload { name: name.clone() },
            }),
            Self::Hangup => None,
        }
    }
}

/// Inbound telephony traffic the bridge cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyEvent {
    /// One caller frame, μ-law 8 kHz.
    Audio(Bytes),
    Mark(String),
    Dtmf(String),
    /// The carrier ended the stream.
    Stopped,
}

impl TelephonyEvent {
    /// Map a parsed message. `connected` and `start` are handled before the
    /// bridge starts and map to `None`.
    pub fn from_message(message: InboundMessage) -> CodecResult<Option<Self>> {
        Ok(match message {
            InboundMessage::Media { media, .. } => Some(Self::Audio(decode_payload(&media.payload)?)),
            InboundMessage::Mark { mark, .. } => Some(Self::Mark(mark.name)),
            InboundMessage::Dtmf { dtmf, .. } => Some(Self::Dtmf(dtmf.digit)),
            InboundMessage::Stop { .. } => Some(Self::Stopped),
            InboundMessage::Connected { .. } | InboundMessage::Start { .. } => None,
        })
    }
}

pub fn decode_payload(payload: &str) -> CodecResult<Bytes> {
    BASE64
        .decode(payload)
        .map(Bytes::from)
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_command_encodes_base64() {
        let message = TelephonyCommand::Media(Bytes::from_static(&[0xFF, 0x7F]))
            .to_message("MZ1")
            .unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["event"], "media");
        assert_eq!(json["streamSid"], "MZ1");
        assert_eq!(json["media"]["payload"], "/38=");
    }

    #[test]
    fn test_clear_command() {
        let json = serde_json::to_value(TelephonyCommand::Clear.to_message("MZ1").unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"event": "clear", "streamSid": "MZ1"}));
        assert!(TelephonyCommand::Hangup.to_message("MZ1").is_none());
    }

    #[test]
    fn test_media_event_decodes_audio() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"event":"media","sequenceNumber":"3","media":{"track":"inbound","chunk":"2","timestamp":"40","payload":"/38="},"streamSid":"MZ1"}"#,
        )
        .unwrap();
        let event = TelephonyEvent::from_message(message).unwrap();
        assert_eq!(event, Some(TelephonyEvent::Audio(Bytes::from_static(&[0xFF, 0x7F]))));
    }

    #[test]
    fn test_bad_payload_is_rejected() {
        assert!(decode_payload("not base64!").is_err());
    }
}
