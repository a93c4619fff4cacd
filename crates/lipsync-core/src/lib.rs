//! # lipsync-core
//!
//! Types shared by every lipsync crate:
//!
//! - Branded identifiers for sessions and jobs ([`ids`])
//! - The JSON wire protocol spoken over the duplex connection ([`protocol`])

#![deny(unsafe_code)]

pub mod ids;
pub mod protocol;

pub use ids::{JobId, SessionId};
pub use protocol::{Frame, InboundRequest, ProtocolError, RequestPayloads};
