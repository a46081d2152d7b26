use crate::error::MpcResult;
use crate::protocol::message::Incoming;
use crate::protocol::round::MpcRound;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{ debug, warn };

/// Per-party protocol driver. Owns the current round, buffers messages that
/// arrive ahead of their round, and advances the state machine whenever the
/// current round reports completion. Single-threaded inside a session; the
/// engine task is the only caller.
pub struct DNode<R: MpcRound> {
    session_id: String,
    round: Option<R>,
    buffer: BTreeMap<u32, Vec<Incoming<R::Msg>>>,
    end_rx: UnboundedReceiver<R::Output>,
    output: Option<R::Output>,
}

impl<R: MpcRound> DNode<R> {
    pub fn new(session_id: String, first_round: R, end_rx: UnboundedReceiver<R::Output>) -> Self {
        DNode {
            session_id,
            round: Some(first_round),
            buffer: BTreeMap::new(),
            end_rx,
            output: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_round(&self) -> u32 {
        self.round.as_ref().map(|r| r.number()).unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.output.is_some()
    }

    /// Kick off the first round. Rounds that expect no messages (a party
    /// with nothing to wait on) advance immediately.
    pub fn start(&mut self) -> MpcResult<()> {
        if let Some(round) = self.round.as_mut() {
            round.start()?;
        }
        self.try_advance()
    }

    /// Deliver one inbound message. Messages for rounds already passed are
    /// dropped, messages for future rounds are buffered and replayed when
    /// their round activates, duplicates are ignored by the rounds
    /// themselves.
    pub fn deliver(&mut self, msg: Incoming<R::Msg>) -> MpcResult<()> {
        if self.output.is_some() {
            return Ok(());
        }
        let current = self.current_round();
        if msg.round < current {
            debug!(
                session = %self.session_id,
                round = msg.round,
                "dropping message for a completed round"
            );
            return Ok(());
        }
        if msg.round > current {
            self.buffer.entry(msg.round).or_default().push(msg);
            return Ok(());
        }
        self.dispatch(msg)?;
        self.try_advance()
    }

    fn dispatch(&mut self, msg: Incoming<R::Msg>) -> MpcResult<()> {
        let round = match self.round.as_mut() {
            Some(round) => round,
            None => return Ok(()),
        };
        if !round.can_accept(&msg) {
            warn!(
                session = %self.session_id,
                round = msg.round,
                "rejecting message the current round does not accept"
            );
            return Ok(());
        }
        round.store_message(msg)
    }

    fn try_advance(&mut self) -> MpcResult<()> {
        loop {
            let complete = match self.round.as_mut() {
                Some(round) => round.update()?,
                None => break,
            };
            if !complete {
                break;
            }
            let finished = self.round.take().expect("round present");
            match finished.next_round() {
                Some(mut next) => {
                    next.start()?;
                    let number = next.number();
                    self.round = Some(next);
                    self.poll_end();
                    if self.output.is_some() {
                        break;
                    }
                    self.replay_buffered(number)?;
                }
                None => break,
            }
        }
        self.poll_end();
        Ok(())
    }

    fn replay_buffered(&mut self, round_number: u32) -> MpcResult<()> {
        if let Some(pending) = self.buffer.remove(&round_number) {
            debug!(
                session = %self.session_id,
                round = round_number,
                replayed = pending.len(),
                "replaying buffered messages"
            );
            for msg in pending {
                self.dispatch(msg)?;
            }
        }
        Ok(())
    }

    fn poll_end(&mut self) {
        if self.output.is_none() {
            if let Ok(output) = self.end_rx.try_recv() {
                self.output = Some(output);
            }
        }
    }

    pub fn take_output(&mut self) -> Option<R::Output> {
        self.poll_end();
        self.output.take()
    }

    /// Hex UIDs of the senders the current round still waits on.
    pub fn waiting_for(&self) -> Vec<String> {
        self.round.as_ref().map(|r| r.waiting_for()).unwrap_or_default()
    }
}
