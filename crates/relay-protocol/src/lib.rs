//! # relay-protocol
//!
//! Wire protocol definitions for the Relay channel broadcast server.
//!
//! Clients and the server exchange JSON text frames:
//!
//! - Client → server: `{"subscribe": [...]}`, `{"unsubscribe": [...]}`,
//!   `{"ping": true}`, in any combination
//! - Server → client: `{"pong": true}` and
//!   `{"error": "invalid_channel", "channel": "..."}`
//!
//! Broadcast payloads travel as opaque text and are not modelled here.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ControlFrame};
//!
//! let frame = codec::decode_control(r#"{"subscribe":["BTC"],"ping":true}"#).unwrap();
//! assert_eq!(frame.subscribe, vec!["BTC"]);
//! assert!(frame.ping);
//!
//! let text = codec::encode_control(&ControlFrame::ping()).unwrap();
//! assert_eq!(text, r#"{"ping":true}"#);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode_control, encode_control, encode_server, is_pong, ProtocolError};
pub use frames::{ControlFrame, ErrorCode, ServerFrame};
