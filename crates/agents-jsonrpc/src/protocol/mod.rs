//! JSON-RPC protocol model
//!
//! This module contains the message model shared by every transport:
//! - JSON-RPC 2.0 message types and batch expansion
//! - Error handling

pub mod error;
pub mod messages;

pub use error::{RpcError, RpcResult};
pub use messages::*;
