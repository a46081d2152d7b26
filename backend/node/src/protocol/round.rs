use crate::error::{ MpcError, MpcResult };
use crate::protocol::message::{ Incoming, Outgoing, Recipients };
use curv::arithmetic::Converter;
use curv::BigInt;
use tokio::sync::mpsc::UnboundedSender;

/// State every round of every protocol shares, composed by value inside each
/// round struct and moved forward by `next_round`. `ok[j]` marks which
/// expected senders have delivered this round's message(s).
pub struct RoundBase<M, O> {
    pub session_id: String,
    pub number: u32,
    pub started: bool,
    pub ok: Vec<bool>,
    pub uid: BigInt,
    /// Own position in the sorted uid ordering; `-1` until the presence
    /// round fixes the participant set.
    pub index: i32,
    pub dnode_count: usize,
    pub threshold: usize,
    pub paillier_bits: usize,
    pub ntilde_bits: usize,
    /// Reshare only: whether this party holds a share of the old key.
    pub old_node: bool,
    pub out: UnboundedSender<Outgoing<M>>,
    pub end: UnboundedSender<O>,
}

impl<M, O> RoundBase<M, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        uid: BigInt,
        dnode_count: usize,
        threshold: usize,
        paillier_bits: usize,
        ntilde_bits: usize,
        old_node: bool,
        out: UnboundedSender<Outgoing<M>>,
        end: UnboundedSender<O>
    ) -> Self {
        RoundBase {
            session_id,
            number: 0,
            started: false,
            ok: vec![false; dnode_count],
            uid,
            index: super::message::PRE_ROUND_INDEX,
            dnode_count,
            threshold,
            paillier_bits,
            ntilde_bits,
            old_node,
            out,
            end,
        }
    }

    /// Move into round `number`: clears the started flag and resets the `ok`
    /// bitmap to `expected` senders.
    pub fn advance(mut self, number: u32, expected: usize) -> Self {
        self.number = number;
        self.started = false;
        self.reset_ok(expected);
        self
    }

    pub fn reset_ok(&mut self, expected: usize) {
        self.ok = vec![false; expected];
    }

    pub fn all_ok(&self) -> bool {
        self.ok.iter().all(|ok| *ok)
    }

    /// Indexes of expected senders that have not delivered yet.
    pub fn waiting_for(&self) -> Vec<usize> {
        self.ok
            .iter()
            .enumerate()
            .filter_map(|(j, ok)| if *ok { None } else { Some(j) })
            .collect()
    }

    pub fn begin(&mut self, number: u32) -> MpcResult<()> {
        if self.started {
            return Err(
                MpcError::InternalInvariantViolated(format!("round {number} already started"))
            );
        }
        self.number = number;
        self.started = true;
        Ok(())
    }

    pub fn send(&self, to: Recipients, payload: M) -> MpcResult<()> {
        let msg = Outgoing { round: self.number, from_index: self.index, to, payload };
        self.out.send(msg).map_err(|_| {
            MpcError::InternalInvariantViolated("outbound channel closed".into())
        })
    }

    pub fn broadcast(&self, payload: M) -> MpcResult<()> {
        self.send(Recipients::Broadcast, payload)
    }

    pub fn unicast(&self, peer: BigInt, payload: M) -> MpcResult<()> {
        self.send(Recipients::Peers(vec![peer]), payload)
    }

    pub fn finish(&self, output: O) -> MpcResult<()> {
        self.end.send(output).map_err(|_| {
            MpcError::InternalInvariantViolated("end channel closed".into())
        })
    }

    /// Map a sender to its index, rejecting envelopes whose claimed index
    /// does not match the pinned ordering.
    pub fn sender_index<T>(&self, ids: &[BigInt], msg: &Incoming<T>) -> Option<usize> {
        if msg.from_index < 0 {
            return None;
        }
        let index = msg.from_index as usize;
        match ids.get(index) {
            Some(uid) if *uid == msg.from_uid => Some(index),
            _ => None,
        }
    }

    pub fn uid_hex(&self, uid: &BigInt) -> String {
        uid.to_str_radix(16)
    }
}

/// The contract every protocol round satisfies. A protocol is a tagged enum
/// over its round structs; `next_round` consumes the current variant and
/// moves the shared base/temp/save state into the next one. The terminal
/// round emits the session output on the end channel from `start` and never
/// completes.
pub trait MpcRound: Sized {
    type Msg: Clone;
    type Output;

    fn number(&self) -> u32;

    /// Local computation for this round; enqueues exactly the mandated
    /// outbound messages. Errors are terminal for the session.
    fn start(&mut self) -> MpcResult<()>;

    /// Payload-shape and broadcast/unicast discipline filter.
    fn can_accept(&self, msg: &Incoming<Self::Msg>) -> bool;

    /// Record an accepted message. Duplicate deliveries leave state
    /// unchanged.
    fn store_message(&mut self, msg: Incoming<Self::Msg>) -> MpcResult<()>;

    /// Whether every expected sender has delivered for this round.
    fn update(&mut self) -> MpcResult<bool>;

    fn next_round(self) -> Option<Self>;

    /// UIDs (hex) of senders this round is still waiting on, for timeout
    /// attribution.
    fn waiting_for(&self) -> Vec<String>;
}
