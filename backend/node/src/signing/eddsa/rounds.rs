use crate::crypto::commit::{ self, Decommitment };
use crate::error::{ AbortReason, FaultKind, MpcError, MpcResult };
use crate::protocol::message::Incoming;
use crate::protocol::round::{ MpcRound, RoundBase };
use crate::signing::eddsa::messages::*;
use crate::signing::eddsa::{ challenge_scalar, EdSignContext, EdSignature };
use curv::arithmetic::Converter;
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Ed25519, Point, Scalar };
use curv::BigInt;
use std::sync::Arc;
use tracing::info;

type EdSgBase = RoundBase<EdSignMessage, EdSignature>;

pub(crate) struct EdSignTemp {
    r_i: Option<Scalar<Ed25519>>,
    own_dr: Option<Decommitment>,
    own_dsb: Option<Decommitment>,
    s_i: Option<Scalar<Ed25519>>,
    big_r: Option<Point<Ed25519>>,
    k: Option<Scalar<Ed25519>>,
    sb_points: Vec<Option<Point<Ed25519>>>,
    r1: Vec<Option<EdSignRound1Message>>,
    r2: Vec<Option<EdSignRound2Message>>,
    r3: Vec<Option<EdSignRound3Message>>,
    r4: Vec<Option<EdSignRound4Message>>,
    r5: Vec<Option<EdSignRound5Message>>,
}

impl EdSignTemp {
    fn new(n: usize) -> Self {
        EdSignTemp {
            r_i: None,
            own_dr: None,
            own_dsb: None,
            s_i: None,
            big_r: None,
            k: None,
            sb_points: vec![None; n],
            r1: vec![None; n],
            r2: vec![None; n],
            r3: vec![None; n],
            r4: vec![None; n],
            r5: vec![None; n],
        }
    }
}

fn missing(what: &str) -> MpcError {
    MpcError::InternalInvariantViolated(format!("missing {what}"))
}

fn abort(round: u32, reason: AbortReason, offender: &BigInt) -> MpcError {
    MpcError::ProtocolAborted { round, reason, offender: Some(offender.to_str_radix(16)) }
}

fn slots_ok<T>(base: &mut EdSgBase, slots: &[Option<T>]) -> bool {
    for (j, slot) in slots.iter().enumerate() {
        base.ok[j] = slot.is_some();
    }
    base.all_ok()
}

fn store_slot<T: Clone>(slots: &mut [Option<T>], index: usize, value: &T) {
    if slots[index].is_none() {
        slots[index] = Some(value.clone());
    }
}

macro_rules! ed_sign_round {
    ($name:ident) => {
        pub struct $name {
            base: EdSgBase,
            ctx: Arc<EdSignContext>,
            temp: Box<EdSignTemp>,
        }
    };
}

ed_sign_round!(Round1);
ed_sign_round!(Round2);
ed_sign_round!(Round3);
ed_sign_round!(Round4);
ed_sign_round!(Round5);
ed_sign_round!(Round6);

/// Threshold Schnorr signing over Ed25519, six rounds:
/// commit R_i, open, commit s_i*B, open, reveal s_i, aggregate.
pub enum EdSignRound {
    R1(Round1),
    R2(Round2),
    R3(Round3),
    R4(Round4),
    R5(Round5),
    R6(Round6),
}

impl EdSignRound {
    pub fn new(mut base: EdSgBase, ctx: Arc<EdSignContext>) -> MpcResult<Self> {
        let n = ctx.sign_ids.len();
        if n != ctx.save.threshold + 1 {
            return Err(
                MpcError::BadInput(
                    format!("signing set has {} members, quorum is {}", n, ctx.save.threshold + 1)
                )
            );
        }
        base.number = 1;
        Ok(EdSignRound::R1(Round1 { base, ctx, temp: Box::new(EdSignTemp::new(n)) }))
    }
}

impl Round1 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(1)?;
        let i = self.base.index as usize;

        let r_i = Scalar::<Ed25519>::random();
        let big_r_i = Point::generator() * &r_i;
        let (cr, dr) = commit::commit(&big_r_i.to_bytes(true));

        let msg = EdSignRound1Message { cr };
        self.temp.r_i = Some(r_i);
        self.temp.own_dr = Some(dr);
        self.temp.r1[i] = Some(msg.clone());

        info!(session = %self.base.session_id, "ed sign round 1: committed to nonce point");
        self.base.broadcast(EdSignMessage::R1(msg))
    }

    fn store(&mut self, msg: Incoming<EdSignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let EdSignMessage::R1(body) = msg.payload {
                store_slot(&mut self.temp.r1, j, &body);
            }
        }
    }
}

impl Round2 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(2)?;
        let i = self.base.index as usize;
        let r_i = self.temp.r_i.clone().ok_or_else(|| missing("nonce"))?;
        let dr = self.temp.own_dr.clone().ok_or_else(|| missing("nonce decommitment"))?;

        let msg = EdSignRound2Message { dr, zk_r: DLogProof::prove(&r_i) };
        self.temp.r2[i] = Some(msg.clone());
        self.base.broadcast(EdSignMessage::R2(msg))
    }

    fn store(&mut self, msg: Incoming<EdSignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let EdSignMessage::R2(body) = msg.payload {
                store_slot(&mut self.temp.r2, j, &body);
            }
        }
    }
}

impl Round3 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(3)?;
        let i = self.base.index as usize;

        let mut big_r = Point::<Ed25519>::zero();
        for (j, uid_j) in self.ctx.sign_ids.iter().enumerate() {
            let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
            let r2 = self.temp.r2[j].as_ref().ok_or_else(|| missing("round 2 message"))?;

            let opened = commit::verify(&r1.cr, &r2.dr).ok_or_else(|| {
                abort(2, AbortReason::CommitMismatch, uid_j)
            })?;
            let big_r_j = Point::from_bytes(&opened).map_err(|_| {
                abort(2, AbortReason::CommitMismatch, uid_j)
            })?;
            if DLogProof::verify(&r2.zk_r).is_err() || r2.zk_r.pk != big_r_j {
                return Err(abort(2, AbortReason::SchnorrProofBad, uid_j));
            }
            big_r = big_r + &big_r_j;
        }

        let k = challenge_scalar(&big_r, &self.ctx.save.pk, &self.ctx.message);
        let lambda = self.ctx.lagrange_for(i)?;
        let w_i = &self.ctx.save.sk_u * &lambda;
        let r_i = self.temp.r_i.clone().ok_or_else(|| missing("nonce"))?;
        let s_i = &r_i + &(&k * &w_i);

        let sb_i = Point::generator() * &s_i;
        let (csb, dsb) = commit::commit(&sb_i.to_bytes(true));

        self.temp.big_r = Some(big_r);
        self.temp.k = Some(k);
        self.temp.s_i = Some(s_i);
        self.temp.own_dsb = Some(dsb);

        let msg = EdSignRound3Message { csb };
        self.temp.r3[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "ed sign round 3: nonce aggregated, share committed");
        self.base.broadcast(EdSignMessage::R3(msg))
    }

    fn store(&mut self, msg: Incoming<EdSignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let EdSignMessage::R3(body) = msg.payload {
                store_slot(&mut self.temp.r3, j, &body);
            }
        }
    }
}

impl Round4 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(4)?;
        let i = self.base.index as usize;
        let dsb = self.temp.own_dsb.clone().ok_or_else(|| missing("share decommitment"))?;

        let msg = EdSignRound4Message { dsb };
        self.temp.r4[i] = Some(msg.clone());
        self.base.broadcast(EdSignMessage::R4(msg))
    }

    fn store(&mut self, msg: Incoming<EdSignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let EdSignMessage::R4(body) = msg.payload {
                store_slot(&mut self.temp.r4, j, &body);
            }
        }
    }
}

impl Round5 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(5)?;
        let i = self.base.index as usize;

        let mut sb_sum = Point::<Ed25519>::zero();
        for (j, uid_j) in self.ctx.sign_ids.iter().enumerate() {
            let r3 = self.temp.r3[j].as_ref().ok_or_else(|| missing("round 3 message"))?;
            let r4 = self.temp.r4[j].as_ref().ok_or_else(|| missing("round 4 message"))?;

            let opened = commit::verify(&r3.csb, &r4.dsb).ok_or_else(|| {
                abort(4, AbortReason::CommitMismatch, uid_j)
            })?;
            let sb_j = Point::from_bytes(&opened).map_err(|_| {
                abort(4, AbortReason::CommitMismatch, uid_j)
            })?;
            sb_sum = sb_sum + &sb_j;
            self.temp.sb_points[j] = Some(sb_j);
        }

        // The aggregate share image must satisfy the group equation before
        // anyone reveals a share.
        let big_r = self.temp.big_r.clone().ok_or_else(|| missing("R"))?;
        let k = self.temp.k.clone().ok_or_else(|| missing("challenge"))?;
        let expected = &big_r + &(&self.ctx.save.pk * &k);
        if sb_sum != expected {
            return Err(MpcError::ProtocolAborted {
                round: 4,
                reason: AbortReason::AggregatePkDisagreement,
                offender: None,
            });
        }

        let msg = EdSignRound5Message {
            s_share: self.temp.s_i.clone().ok_or_else(|| missing("share"))?,
        };
        self.temp.r5[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "ed sign round 5: group equation held, revealing share");
        self.base.broadcast(EdSignMessage::R5(msg))
    }

    fn store(&mut self, msg: Incoming<EdSignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let EdSignMessage::R5(body) = msg.payload {
                store_slot(&mut self.temp.r5, j, &body);
            }
        }
    }
}

impl Round6 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(6)?;

        let big_r = self.temp.big_r.clone().ok_or_else(|| missing("R"))?;
        let k = self.temp.k.clone().ok_or_else(|| missing("challenge"))?;

        let mut s = Scalar::<Ed25519>::zero();
        for (j, uid_j) in self.ctx.sign_ids.iter().enumerate() {
            let r5 = self.temp.r5[j].as_ref().ok_or_else(|| missing("share"))?;
            let sb_j = self.temp.sb_points[j].clone().ok_or_else(|| missing("share image"))?;
            // Each revealed share must match the image committed before the
            // equation check; a mismatch is attributable.
            if Point::generator() * &r5.s_share != sb_j {
                return Err(MpcError::PeerFaulted {
                    uid: uid_j.to_str_radix(16),
                    kind: FaultKind::BadSignatureShare,
                });
            }
            s = s + &r5.s_share;
        }

        let expected = &big_r + &(&self.ctx.save.pk * &k);
        if Point::generator() * &s != expected {
            return Err(MpcError::ProtocolAborted {
                round: 5,
                reason: AbortReason::AggregatePkDisagreement,
                offender: None,
            });
        }

        info!(session = %self.base.session_id, "ed signature assembled and verified");
        self.base.finish(EdSignature { r: big_r, s })
    }
}

impl MpcRound for EdSignRound {
    type Msg = EdSignMessage;
    type Output = EdSignature;

    fn number(&self) -> u32 {
        match self {
            EdSignRound::R1(_) => 1,
            EdSignRound::R2(_) => 2,
            EdSignRound::R3(_) => 3,
            EdSignRound::R4(_) => 4,
            EdSignRound::R5(_) => 5,
            EdSignRound::R6(_) => 6,
        }
    }

    fn start(&mut self) -> MpcResult<()> {
        match self {
            EdSignRound::R1(r) => r.start(),
            EdSignRound::R2(r) => r.start(),
            EdSignRound::R3(r) => r.start(),
            EdSignRound::R4(r) => r.start(),
            EdSignRound::R5(r) => r.start(),
            EdSignRound::R6(r) => r.start(),
        }
    }

    fn can_accept(&self, msg: &Incoming<EdSignMessage>) -> bool {
        match (self, &msg.payload) {
            (EdSignRound::R1(_), EdSignMessage::R1(_)) => msg.is_broadcast,
            (EdSignRound::R2(_), EdSignMessage::R2(_)) => msg.is_broadcast,
            (EdSignRound::R3(_), EdSignMessage::R3(_)) => msg.is_broadcast,
            (EdSignRound::R4(_), EdSignMessage::R4(_)) => msg.is_broadcast,
            (EdSignRound::R5(_), EdSignMessage::R5(_)) => msg.is_broadcast,
            _ => false,
        }
    }

    fn store_message(&mut self, msg: Incoming<EdSignMessage>) -> MpcResult<()> {
        match self {
            EdSignRound::R1(r) => r.store(msg),
            EdSignRound::R2(r) => r.store(msg),
            EdSignRound::R3(r) => r.store(msg),
            EdSignRound::R4(r) => r.store(msg),
            EdSignRound::R5(r) => r.store(msg),
            EdSignRound::R6(_) => {}
        }
        Ok(())
    }

    fn update(&mut self) -> MpcResult<bool> {
        Ok(match self {
            EdSignRound::R1(r) => slots_ok(&mut r.base, &r.temp.r1),
            EdSignRound::R2(r) => slots_ok(&mut r.base, &r.temp.r2),
            EdSignRound::R3(r) => slots_ok(&mut r.base, &r.temp.r3),
            EdSignRound::R4(r) => slots_ok(&mut r.base, &r.temp.r4),
            EdSignRound::R5(r) => slots_ok(&mut r.base, &r.temp.r5),
            EdSignRound::R6(_) => false,
        })
    }

    fn next_round(self) -> Option<Self> {
        match self {
            EdSignRound::R1(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EdSignRound::R2(Round2 { base: r.base.advance(2, n), ctx: r.ctx, temp: r.temp }))
            }
            EdSignRound::R2(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EdSignRound::R3(Round3 { base: r.base.advance(3, n), ctx: r.ctx, temp: r.temp }))
            }
            EdSignRound::R3(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EdSignRound::R4(Round4 { base: r.base.advance(4, n), ctx: r.ctx, temp: r.temp }))
            }
            EdSignRound::R4(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EdSignRound::R5(Round5 { base: r.base.advance(5, n), ctx: r.ctx, temp: r.temp }))
            }
            EdSignRound::R5(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EdSignRound::R6(Round6 { base: r.base.advance(6, n), ctx: r.ctx, temp: r.temp }))
            }
            EdSignRound::R6(_) => None,
        }
    }

    fn waiting_for(&self) -> Vec<String> {
        let (base, ids) = match self {
            EdSignRound::R1(r) => (&r.base, &r.ctx.sign_ids),
            EdSignRound::R2(r) => (&r.base, &r.ctx.sign_ids),
            EdSignRound::R3(r) => (&r.base, &r.ctx.sign_ids),
            EdSignRound::R4(r) => (&r.base, &r.ctx.sign_ids),
            EdSignRound::R5(r) => (&r.base, &r.ctx.sign_ids),
            EdSignRound::R6(r) => (&r.base, &r.ctx.sign_ids),
        };
        base.waiting_for()
            .into_iter()
            .filter_map(|j| ids.get(j).map(|uid| uid.to_str_radix(16)))
            .collect()
    }
}
