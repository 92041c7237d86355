pub const STATUS_DETECTED: &str = "SENSOR:DETECTED";
pub const STATUS_NO_OBJECT: &str = "SENSOR:NO_OBJECT";

/// A datagram received on the status channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusMessage {
    Detected,
    NoObject,
    Unrecognized(/* raw payload */ String),
}

impl StatusMessage {
    /// Classifies a raw payload. Matching is case-sensitive after trimming
    /// surrounding whitespace; payloads that are not valid UTF-8 are unrecognized.
    pub fn parse(payload: &[u8]) -> Self {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => {
                return StatusMessage::Unrecognized(String::from_utf8_lossy(payload).into_owned());
            }
        };

        match text.trim() {
            STATUS_DETECTED => StatusMessage::Detected,
            STATUS_NO_OBJECT => StatusMessage::NoObject,
            _ => StatusMessage::Unrecognized(text.to_string()),
        }
    }

    /// The gate value this message asks for, if any.
    pub fn gate_value(&self) -> Option<bool> {
        match self {
            StatusMessage::Detected => Some(true),
            StatusMessage::NoObject => Some(false),
            StatusMessage::Unrecognized(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartRateEvent {
    /// Beats per minute.
    pub heartrate: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboundSample {
    pub heartrate_to_send: u16,
}

impl OutboundSample {
    pub fn gated(event: HeartRateEvent, detected: bool) -> Self {
        OutboundSample {
            heartrate_to_send: if detected { event.heartrate } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_codes() {
        assert_eq!(StatusMessage::parse(b"SENSOR:DETECTED"), StatusMessage::Detected);
        assert_eq!(StatusMessage::parse(b"SENSOR:NO_OBJECT"), StatusMessage::NoObject);
        assert_eq!(
            StatusMessage::parse(b"  SENSOR:DETECTED\r\n"),
            StatusMessage::Detected
        );
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        assert_eq!(
            StatusMessage::parse(b"sensor:detected"),
            StatusMessage::Unrecognized("sensor:detected".to_string())
        );
    }

    #[test]
    fn test_parse_unrecognized() {
        let message = StatusMessage::parse(b"Phototransistor is reading:  41232");
        assert_eq!(message.gate_value(), None);
        assert!(matches!(StatusMessage::parse(&[0xff, 0xfe, 0x00]), StatusMessage::Unrecognized(_)));
        assert!(matches!(StatusMessage::parse(b""), StatusMessage::Unrecognized(_)));
    }

    #[test]
    fn test_gated_sample() {
        let event = HeartRateEvent { heartrate: 72 };
        assert_eq!(OutboundSample::gated(event, true).heartrate_to_send, 72);
        assert_eq!(OutboundSample::gated(event, false).heartrate_to_send, 0);
    }
}
