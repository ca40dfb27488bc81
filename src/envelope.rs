//! Wire envelope for protocol ciphertexts.
//!
//! An envelope is a JSON object with a fixed version tag (`v = 2`), a
//! ratchet header, a base64 ciphertext, and, on the very first message of
//! a session from the initiator, an X3DH preamble.

use crate::error::{Error, Result};
use crate::keys::Jwk;

use serde::{Deserialize, Serialize};

/// Fixed envelope version tag
pub const ENVELOPE_VERSION: u8 = 2;

/// Ratchet message header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current ratchet public key
    pub dh: Jwk,
    /// Previous sending-chain length
    pub pn: u32,
    /// Message sequence number in the current chain
    pub n: u32,
}

/// X3DH preamble carried by the first message of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3dhPreamble {
    /// Initiator's long-term identity public key
    #[serde(rename = "identityKey")]
    pub identity_key: Jwk,
    /// Initiator's ephemeral public key
    #[serde(rename = "ephemeralKey")]
    pub ephemeral_key: Jwk,
    /// Claimed one-time prekey id, if one was available
    #[serde(
        rename = "oneTimePreKeyId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub one_time_prekey_id: Option<u32>,
}

/// The on-the-wire ciphertext object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Version tag, always 2
    pub v: u8,
    /// Ratchet header
    pub header: Header,
    /// Base64 AEAD ciphertext
    pub ciphertext: String,
    /// X3DH preamble, present only on the first message from the initiator
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x3dh: Option<X3dhPreamble>,
}

impl Envelope {
    /// Serialize to the wire JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| Error::MalformedEnvelope)
    }

    /// Parse from a wire JSON string; rejects unknown versions
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|_| Error::MalformedEnvelope)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(Error::MalformedEnvelope);
        }
        Ok(envelope)
    }
}

/// Pure predicate: does `text` parse as JSON with `v == 2` and both
/// `header` and `ciphertext` fields?
#[must_use]
pub fn is_signal_envelope(text: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return false;
    };
    value.get("v").and_then(serde_json::Value::as_u64) == Some(u64::from(ENVELOPE_VERSION))
        && value.get("header").is_some()
        && value.get("ciphertext").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_dh_keypair;

    fn sample_header() -> Header {
        Header {
            dh: generate_dh_keypair().public().to_jwk(),
            pn: 3,
            n: 7,
        }
    }

    #[test]
    fn round_trip_without_preamble() {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "AAEC".to_string(),
            x3dh: None,
        };
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("x3dh"));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed.header.pn, 3);
        assert_eq!(parsed.header.n, 7);
        assert!(parsed.x3dh.is_none());
    }

    #[test]
    fn round_trip_with_preamble() {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "AAEC".to_string(),
            x3dh: Some(X3dhPreamble {
                identity_key: generate_dh_keypair().public().to_jwk(),
                ephemeral_key: generate_dh_keypair().public().to_jwk(),
                one_time_prekey_id: Some(12),
            }),
        };
        let json = envelope.to_json().unwrap();
        assert!(json.contains("identityKey"));
        assert!(json.contains("ephemeralKey"));
        assert!(json.contains("oneTimePreKeyId"));

        let parsed = Envelope::from_json(&json).unwrap();
        let preamble = parsed.x3dh.expect("preamble survives round trip");
        assert_eq!(preamble.one_time_prekey_id, Some(12));
    }

    #[test]
    fn preamble_key_id_is_optional() {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "AAEC".to_string(),
            x3dh: Some(X3dhPreamble {
                identity_key: generate_dh_keypair().public().to_jwk(),
                ephemeral_key: generate_dh_keypair().public().to_jwk(),
                one_time_prekey_id: None,
            }),
        };
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("oneTimePreKeyId"));
        assert!(Envelope::from_json(&json).is_ok());
    }

    #[test]
    fn rejects_unknown_version() {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "AAEC".to_string(),
            x3dh: None,
        };
        let json = envelope.to_json().unwrap().replace("\"v\":2", "\"v\":1");
        assert_eq!(
            Envelope::from_json(&json).unwrap_err(),
            Error::MalformedEnvelope
        );
    }

    #[test]
    fn predicate_accepts_protocol_envelopes() {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            header: sample_header(),
            ciphertext: "AAEC".to_string(),
            x3dh: None,
        };
        assert!(is_signal_envelope(&envelope.to_json().unwrap()));
    }

    #[test]
    fn predicate_rejects_other_payloads() {
        assert!(!is_signal_envelope("just some text"));
        assert!(!is_signal_envelope("{\"v\":1,\"header\":{},\"ciphertext\":\"x\"}"));
        assert!(!is_signal_envelope("{\"v\":2,\"header\":{}}"));
        assert!(!is_signal_envelope("{\"v\":2,\"ciphertext\":\"x\"}"));
        assert!(!is_signal_envelope("{}"));
    }
}
