use curv::arithmetic::Converter;
use curv::BigInt;
use serde::{ Deserialize, Serialize };

/// Sender index used before the participant ordering is pinned down by the
/// presence round.
pub const PRE_ROUND_INDEX: i32 = -1;

/// Wire-level protocol message: who sent it, how it was addressed, which
/// round it belongs to, and the round-typed payload as canonical JSON.
/// Messages are content-addressed by `(session_id, sender_uid, round)`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Envelope {
    pub from_uid: String,
    pub from_index: i32,
    pub is_broadcast: bool,
    /// Destination UIDs, decimal; empty means broadcast.
    pub to: Vec<String>,
    pub round: u32,
    pub payload: Vec<u8>,
}

/// Addressing of an outbound round message.
#[derive(Clone, Debug, PartialEq)]
pub enum Recipients {
    Broadcast,
    Peers(Vec<BigInt>),
}

/// What a round hands to the out channel; the session layer stamps the
/// sender identity and frames it for the bus.
#[derive(Clone, Debug)]
pub struct Outgoing<M> {
    pub round: u32,
    pub from_index: i32,
    pub to: Recipients,
    pub payload: M,
}

/// A decoded inbound message as the round machines consume it.
#[derive(Clone, Debug)]
pub struct Incoming<M> {
    pub from_uid: BigInt,
    pub from_index: i32,
    pub is_broadcast: bool,
    pub round: u32,
    pub payload: M,
}

impl<M> Outgoing<M> {
    pub fn broadcast(round: u32, from_index: i32, payload: M) -> Self {
        Outgoing { round, from_index, to: Recipients::Broadcast, payload }
    }

    pub fn to_peer(round: u32, from_index: i32, peer: BigInt, payload: M) -> Self {
        Outgoing { round, from_index, to: Recipients::Peers(vec![peer]), payload }
    }
}

impl Envelope {
    pub fn sender_uid(&self) -> Option<BigInt> {
        BigInt::from_str_radix(&self.from_uid, 10).ok()
    }
}
