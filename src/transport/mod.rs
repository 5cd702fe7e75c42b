//! Reply transport over TCP.
//!
//! Replies travel as newline-delimited JSON: one [`Reply`] per line.
//! [`TcpReplyServer`] accepts connections from command and event consumers
//! and feeds every decoded reply into a correlator inbox.
//! [`TcpReplySender`] is the consumer side, implementing [`ReplySender`].
//!
//! [`ReplySender`]: crate::interfaces::ReplySender

mod tcp;

pub use tcp::{TcpReplySender, TcpReplyServer};

use crate::interfaces::transport::Result;
use crate::messages::Reply;

/// Encode a reply as one JSON line.
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(reply)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a reply from one line, without its terminator.
pub fn decode_reply(line: &str) -> Result<Reply> {
    Ok(serde_json::from_str(line)?)
}
