//! Frame types for the Relay protocol.
//!
//! Frames are JSON text messages. Clients send [`ControlFrame`]s to manage
//! their channel membership; the server answers with [`ServerFrame`]s. Broadcast
//! payloads are not frames at all: they are forwarded as opaque text.

use serde::{Deserialize, Serialize};

/// Client to server control frame.
///
/// Every key is optional on the wire, and any subset may appear together:
///
/// ```json
/// {"subscribe": ["BTC", "ETH"], "unsubscribe": ["XRP"], "ping": true}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Channels to join, processed in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribe: Vec<String>,

    /// Channels to leave, processed in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsubscribe: Vec<String>,

    /// Keepalive request; answered with `{"pong":true}`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ping: bool,
}

impl ControlFrame {
    /// Create a frame that only pings.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            ping: true,
            ..Self::default()
        }
    }

    /// Create a subscribe frame.
    #[must_use]
    pub fn subscribe<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscribe: channels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Create an unsubscribe frame.
    #[must_use]
    pub fn unsubscribe<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unsubscribe: channels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check whether the frame carries no instruction at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.ping && self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

/// Error codes carried by [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The channel name was rejected by validation.
    InvalidChannel,
    /// The connection already holds the maximum number of subscriptions.
    TooManySubscriptions,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidChannel => "invalid_channel",
            ErrorCode::TooManySubscriptions => "too_many_subscriptions",
        }
    }
}

/// Server to client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Reply to a ping: `{"pong":true}`.
    Pong {
        /// Always `true`.
        pong: bool,
    },

    /// Per-channel rejection: `{"error":"invalid_channel","channel":"XYZ"}`.
    Error {
        /// What went wrong.
        #[serde(rename = "error")]
        code: ErrorCode,
        /// The channel the request referred to.
        channel: String,
    },
}

impl ServerFrame {
    /// Create a pong frame.
    #[must_use]
    pub fn pong() -> Self {
        ServerFrame::Pong { pong: true }
    }

    /// Create an `invalid_channel` error frame.
    #[must_use]
    pub fn invalid_channel(channel: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: ErrorCode::InvalidChannel,
            channel: channel.into(),
        }
    }

    /// Create a `too_many_subscriptions` error frame.
    #[must_use]
    pub fn too_many_subscriptions(channel: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: ErrorCode::TooManySubscriptions,
            channel: channel.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_omits_empty_fields() {
        let json = serde_json::to_string(&ControlFrame::ping()).unwrap();
        assert_eq!(json, r#"{"ping":true}"#);

        let json = serde_json::to_string(&ControlFrame::subscribe(["BTC", "ETH"])).unwrap();
        assert_eq!(json, r#"{"subscribe":["BTC","ETH"]}"#);
    }

    #[test]
    fn test_server_frame_shapes() {
        let pong = serde_json::to_string(&ServerFrame::pong()).unwrap();
        assert_eq!(pong, r#"{"pong":true}"#);

        let err = serde_json::to_string(&ServerFrame::invalid_channel("XYZ")).unwrap();
        assert_eq!(err, r#"{"error":"invalid_channel","channel":"XYZ"}"#);

        let err = serde_json::to_string(&ServerFrame::too_many_subscriptions("A")).unwrap();
        assert_eq!(err, r#"{"error":"too_many_subscriptions","channel":"A"}"#);
    }

    #[test]
    fn test_control_frame_is_empty() {
        assert!(ControlFrame::default().is_empty());
        assert!(!ControlFrame::ping().is_empty());
        assert!(!ControlFrame::unsubscribe(["A"]).is_empty());
    }
}
