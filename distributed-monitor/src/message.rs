//! The five-field message record, recast as a tagged union instead of a
//! struct with fields that are only meaningful for some message types — the
//! `token`/`recipient`/`sn`/`data` fields of the original record are each
//! owned by exactly one variant here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{anyhow, Result};

/// A `REQUEST` sequence number.
pub type Sn = u64;

/// The group-unique mutual exclusion token: `LN` and the waiter queue `Q`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// `ln[j]` is the sn of peer j's most recently granted request.
    pub ln: Vec<Sn>,
    /// Peer ids currently deemed waiting for the CS, in grant order.
    pub q: Vec<usize>,
}

impl Token {
    pub fn new(group_size: usize) -> Self {
        Self {
            ln: vec![0; group_size],
            q: Vec::new(),
        }
    }
}

/// A message broadcast over the fanout transport.
///
/// `D` is the opaque, application-defined payload carried by `Set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<D> {
    Request { pid: usize, sn: Sn },
    Token { pid: usize, recipient: usize, token: Token },
    Pulse { pid: usize, recipient: Option<usize> },
    Set { pid: usize, data: D },
}

impl<D> Message<D> {
    pub fn sender(&self) -> usize {
        match self {
            Message::Request { pid, .. }
            | Message::Token { pid, .. }
            | Message::Pulse { pid, .. }
            | Message::Set { pid, .. } => *pid,
        }
    }
}

pub fn encode<D: Serialize>(msg: &Message<D>) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| anyhow!("message failed to encode: {e}"))
}

pub fn decode<D: DeserializeOwned>(bytes: &[u8]) -> Result<Message<D>> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("message failed to decode: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let token = Token {
            ln: vec![1, 2, 3],
            q: vec![2],
        };
        let msgs: Vec<Message<i32>> = vec![
            Message::Request { pid: 1, sn: 4 },
            Message::Token {
                pid: 0,
                recipient: 1,
                token,
            },
            Message::Pulse {
                pid: 2,
                recipient: None,
            },
            Message::Set { pid: 3, data: 42 },
        ];
        for msg in msgs {
            let bytes = encode(&msg).unwrap();
            let back: Message<i32> = decode(&bytes).unwrap();
            assert_eq!(back.sender(), msg.sender());
        }
    }

    #[test]
    fn decode_garbage_is_a_codec_error() {
        let err = decode::<i32>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.to_string().contains("failed to decode"));
    }
}
