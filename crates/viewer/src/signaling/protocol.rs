//! Signaling relay wire protocol
//!
//! The relay speaks a small line protocol: bare text commands for
//! registration and session setup, JSON objects for SDP and ICE.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Registration acknowledgement / request keyword
pub const HELLO: &str = "HELLO";

/// Session acknowledgement keyword
pub const SESSION_OK: &str = "SESSION_OK";

/// Stream start directive sent by an answer-only client
pub const START_WEBRTC_STREAM: &str = "START_WEBRTC_STREAM";

/// Prefix of fatal relay errors
pub const ERROR_PREFIX: &str = "ERROR";

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback
    Rollback,
}

/// SDP description in its browser JSON form: `{"type": "offer", "sdp": "v=0..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP text
    pub sdp: String,
}

/// ICE candidate in its browser JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line (`candidate:...`)
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// True for offers
    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// Message received from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `HELLO` registration acknowledgement
    Hello,
    /// `SESSION_OK` session acknowledgement
    SessionOk,
    /// `ERROR...` fatal session error (full text kept)
    Error(String),
    /// `{"sdp": ...}`
    Sdp(SessionDescription),
    /// `{"ice": ...}`
    Ice(IceCandidate),
}

/// Message sent to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `HELLO <peer_id>`
    Hello(String),
    /// `SESSION <remote_peer_id>`
    Session(String),
    /// `START_WEBRTC_STREAM`
    StartWebrtcStream,
    /// `{"sdp": ...}`
    Sdp(SessionDescription),
    /// `{"ice": ...}`
    Ice(IceCandidate),
}

#[derive(Serialize)]
struct SdpEnvelope<'a> {
    sdp: &'a SessionDescription,
}

#[derive(Serialize)]
struct IceEnvelope<'a> {
    ice: &'a IceCandidate,
}

impl ServerMessage {
    /// Parse one text frame from the relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] for non-JSON payloads that are not a
    /// known keyword, for JSON with neither `sdp` nor `ice`, and for `sdp`/`ice`
    /// values of the wrong shape.
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            HELLO => return Ok(ServerMessage::Hello),
            SESSION_OK => return Ok(ServerMessage::SessionOk),
            _ => {}
        }

        if text.starts_with(ERROR_PREFIX) {
            return Ok(ServerMessage::Error(text.to_string()));
        }

        let value: Value = serde_json::from_str(text).map_err(|_| {
            Error::ProtocolError(format!("Error parsing incoming JSON: {}", text))
        })?;

        if let Some(sdp) = value.get("sdp").filter(|v| !v.is_null()) {
            let desc = SessionDescription::deserialize(sdp)
                .map_err(|e| Error::ProtocolError(format!("Invalid SDP payload: {}", e)))?;
            return Ok(ServerMessage::Sdp(desc));
        }

        if let Some(ice) = value.get("ice").filter(|v| !v.is_null()) {
            let candidate = IceCandidate::deserialize(ice)
                .map_err(|e| Error::ProtocolError(format!("Invalid ICE payload: {}", e)))?;
            return Ok(ServerMessage::Ice(candidate));
        }

        Err(Error::ProtocolError(format!("Unknown incoming JSON: {}", text)))
    }
}

impl ClientMessage {
    /// Encode as a text frame
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            ClientMessage::Hello(peer_id) => format!("{} {}", HELLO, peer_id),
            ClientMessage::Session(peer_id) => format!("SESSION {}", peer_id),
            ClientMessage::StartWebrtcStream => START_WEBRTC_STREAM.to_string(),
            ClientMessage::Sdp(sdp) => serde_json::to_string(&SdpEnvelope { sdp })?,
            ClientMessage::Ice(ice) => serde_json::to_string(&IceEnvelope { ice })?,
        })
    }
}
