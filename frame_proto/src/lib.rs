//! Wire messages exchanged with the people-counting backend.
//!
//! Duplex channel: the client pushes one data URL per text frame and the
//! backend answers with tagged JSON objects ([`ServerMessage`]).
//! Request/response: the client posts a [`FrameRequest`] and gets an
//! [`Analysis`] back.

use serde::{Deserialize, Serialize};

pub const DATA_URL_JPEG_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent once the backend accepts the socket.
    Connection {
        #[serde(default)]
        message: String,
    },
    ImageAnalysis {
        data: Analysis,
    },
    /// Processing failure for one frame. The socket stays open.
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub people_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Set by the backend when detection failed; `people_count` is then 0
    /// and meaningless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Analysis {
    pub fn count(people_count: u32) -> Self {
        Self {
            people_count,
            label: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRequest {
    pub image: String,
}
