use crate::crypto::ntilde::generate_ntilde;
use crate::crypto::paillier;
use crate::crypto::vss;
use crate::error::{ AbortReason, FaultKind, MpcError, MpcResult };
use crate::keygen::ecdsa::KeygenSaveData;
use crate::party::{ index_of, lagrange_coeff };
use crate::protocol::message::Incoming;
use crate::protocol::round::{ MpcRound, RoundBase };
use crate::reshare::messages::*;
use crate::reshare::{ ReshareContext, ReshareOutput };
use curv::arithmetic::{ BitManipulation, Converter };
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use std::sync::Arc;
use tracing::info;

type RsBase = RoundBase<ReshareMessage, ReshareOutput>;

pub(crate) struct ReshareTemp {
    own_shares: Vec<Scalar<Secp256k1>>,
    paillier_sk: Option<paillier::PrivateKey>,
    new_sk: Option<Scalar<Secp256k1>>,
    r1: Vec<Option<ReshareRound1Message>>,
    r2: Vec<Option<ReshareRound2Message>>,
    r3: Vec<Option<ReshareRound3Message>>,
    r4: Vec<Option<ReshareRound4Message>>,
}

impl ReshareTemp {
    fn new(old: usize, new: usize, union: usize) -> Self {
        ReshareTemp {
            own_shares: Vec::new(),
            paillier_sk: None,
            new_sk: None,
            r1: vec![None; old],
            r2: vec![None; old],
            r3: vec![None; new],
            r4: vec![None; union],
        }
    }
}

fn missing(what: &str) -> MpcError {
    MpcError::InternalInvariantViolated(format!("missing {what}"))
}

fn abort(round: u32, reason: AbortReason, offender: Option<&BigInt>) -> MpcError {
    MpcError::ProtocolAborted {
        round,
        reason,
        offender: offender.map(|uid| uid.to_str_radix(16)),
    }
}

fn slots_ok<T>(base: &mut RsBase, slots: &[Option<T>]) -> bool {
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

macro_rules! reshare_round {
    ($name:ident) => {
        pub struct $name {
            base: RsBase,
            ctx: Arc<ReshareContext>,
            temp: Box<ReshareTemp>,
        }
    };
}

reshare_round!(Round0);
reshare_round!(Round1);
reshare_round!(Round2);
reshare_round!(Round3);
reshare_round!(Round4);
reshare_round!(Round5);

/// Committee rotation: old quorum members act as share donors, new members
/// regenerate their auxiliary material and assemble fresh shares of the same
/// key. `Round0 -> ... -> Round5 (terminal)`.
pub enum ReshareRound {
    R0(Round0),
    R1(Round1),
    R2(Round2),
    R3(Round3),
    R4(Round4),
    R5(Round5),
}

impl ReshareRound {
    pub fn new(base: RsBase, ctx: Arc<ReshareContext>) -> Self {
        let temp = Box::new(
            ReshareTemp::new(ctx.old_ids.len(), ctx.new_ids.len(), ctx.union_ids.len())
        );
        ReshareRound::R0(Round0 { base, ctx, temp })
    }
}

fn old_pos(ctx: &ReshareContext, uid: &BigInt) -> Option<usize> {
    index_of(&ctx.old_ids, uid)
}

fn new_pos(ctx: &ReshareContext, uid: &BigInt) -> Option<usize> {
    index_of(&ctx.new_ids, uid)
}

impl Round0 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(0)?;
        let pos = index_of(&self.ctx.union_ids, &self.base.uid).ok_or_else(|| {
            MpcError::BadInput("own uid is in neither committee".into())
        })?;
        if self.base.old_node && self.ctx.old_save.is_none() {
            return Err(MpcError::BadInput("old node without a key share".into()));
        }
        self.base.ok[pos] = true;
        info!(
            session = %self.base.session_id,
            old_node = self.base.old_node,
            "reshare round 0: announcing presence"
        );
        self.base.broadcast(
            ReshareMessage::R0(ReshareRound0Message {
                uid: self.base.uid.clone(),
                old_node: self.base.old_node,
            })
        )
    }

    fn store(&mut self, msg: Incoming<ReshareMessage>) {
        if let ReshareMessage::R0(body) = msg.payload {
            if body.uid != msg.from_uid {
                return;
            }
            if let Some(pos) = index_of(&self.ctx.union_ids, &body.uid) {
                self.base.ok[pos] = true;
            }
        }
    }

    fn next(self) -> Round1 {
        let old = self.ctx.old_ids.len();
        let index = index_of(&self.ctx.union_ids, &self.base.uid)
            .expect("own uid checked in round 0");
        let mut base = self.base.advance(1, old);
        base.index = index as i32;
        Round1 { base, ctx: self.ctx, temp: self.temp }
    }
}

impl Round1 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(1)?;
        let save = match self.ctx.old_save.as_ref() {
            Some(save) => save,
            // Fresh nodes only collect in this round.
            None => return Ok(()),
        };

        let order = Scalar::<Secp256k1>::group_order();
        let lambda = lagrange_coeff(&self.ctx.old_ids, &self.base.uid, order)?;
        let w_i = &save.sk_u * &Scalar::from_bigint(&lambda);

        let (commitments, shares) = vss::share(&w_i, self.ctx.new_threshold, &self.ctx.new_ids);
        self.temp.own_shares = shares;

        let own_old = old_pos(&self.ctx, &self.base.uid).ok_or_else(|| {
            MpcError::BadInput("old node is not in the old quorum".into())
        })?;
        let msg = ReshareRound1Message { commitments };
        self.temp.r1[own_old] = Some(msg.clone());
        info!(session = %self.base.session_id, "reshare round 1: donated share committed");
        self.base.broadcast(ReshareMessage::R1(msg))
    }

    fn store(&mut self, msg: Incoming<ReshareMessage>) {
        if let ReshareMessage::R1(body) = msg.payload {
            if let Some(j) = old_pos(&self.ctx, &msg.from_uid) {
                store_slot(&mut self.temp.r1, j, &body);
            }
        }
    }
}

impl Round2 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(2)?;
        if self.ctx.old_save.is_none() {
            return Ok(());
        }
        let own_old = old_pos(&self.ctx, &self.base.uid).ok_or_else(|| {
            MpcError::BadInput("old node is not in the old quorum".into())
        })?;

        for (j, uid_j) in self.ctx.new_ids.iter().enumerate() {
            let share = self.temp.own_shares
                .get(j)
                .cloned()
                .ok_or_else(|| missing("donated share"))?;
            if *uid_j == self.base.uid {
                self.temp.r2[own_old] = Some(ReshareRound2Message { share });
                continue;
            }
            self.base.unicast(uid_j.clone(), ReshareMessage::R2(ReshareRound2Message { share }))?;
        }
        Ok(())
    }

    fn store(&mut self, msg: Incoming<ReshareMessage>) {
        if let ReshareMessage::R2(body) = msg.payload {
            if let Some(j) = old_pos(&self.ctx, &msg.from_uid) {
                store_slot(&mut self.temp.r2, j, &body);
            }
        }
    }
}

impl Round3 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(3)?;
        let own_new = match new_pos(&self.ctx, &self.base.uid) {
            Some(pos) => pos,
            // Donor-only parties have nothing to regenerate.
            None => return Ok(()),
        };

        let (paillier_pk, paillier_sk) =
            paillier::generate_key_pair(self.base.paillier_bits, &self.ctx.pool);
        let ntilde = generate_ntilde(self.base.ntilde_bits, &self.ctx.pool);
        let fact_proof = paillier_sk.zk_fact_prove();
        self.temp.paillier_sk = Some(paillier_sk);

        let msg = ReshareRound3Message { paillier_pk, ntilde, fact_proof };
        self.temp.r3[own_new] = Some(msg.clone());
        info!(session = %self.base.session_id, "reshare round 3: fresh paillier and ntilde ready");
        self.base.broadcast(ReshareMessage::R3(msg))
    }

    fn store(&mut self, msg: Incoming<ReshareMessage>) {
        if let ReshareMessage::R3(body) = msg.payload {
            if let Some(j) = new_pos(&self.ctx, &msg.from_uid) {
                store_slot(&mut self.temp.r3, j, &body);
            }
        }
    }
}

impl Round4 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(4)?;
        let own_union = self.base.index as usize;

        // The donated polynomials must reassemble exactly the key being
        // reshared.
        let mut pk = Point::<Secp256k1>::zero();
        for (j, uid_j) in self.ctx.old_ids.iter().enumerate() {
            let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
            let commitments = &r1.commitments;
            if commitments.threshold != self.ctx.new_threshold
                || commitments.commitments.len() != self.ctx.new_threshold + 1
            {
                return Err(abort(1, AbortReason::VssShareBad, Some(uid_j)));
            }
            let head = commitments.secret_commitment().ok_or_else(|| missing("commitment"))?;
            pk = pk + head;
        }
        if pk != self.ctx.expected_pk {
            return Err(abort(1, AbortReason::AggregatePkDisagreement, None));
        }

        if let Some(own_new) = new_pos(&self.ctx, &self.base.uid) {
            for (j, uid_j) in self.ctx.new_ids.iter().enumerate() {
                if j == own_new {
                    continue;
                }
                let r3 = self.temp.r3[j].as_ref().ok_or_else(|| missing("round 3 message"))?;
                if !r3.ntilde.verify() {
                    return Err(MpcError::PeerFaulted {
                        uid: uid_j.to_str_radix(16),
                        kind: FaultKind::NtildeProofBad,
                    });
                }
                if r3.paillier_pk.n.bit_length() + 2 < self.base.paillier_bits
                    || !r3.paillier_pk.zk_fact_verify(&r3.fact_proof)
                {
                    return Err(MpcError::PeerFaulted {
                        uid: uid_j.to_str_radix(16),
                        kind: FaultKind::PaillierProofBad,
                    });
                }
            }

            let mut new_sk = Scalar::<Secp256k1>::zero();
            for (j, uid_j) in self.ctx.old_ids.iter().enumerate() {
                let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
                let r2 = self.temp.r2[j].as_ref().ok_or_else(|| missing("donated share"))?;
                if !r1.commitments.validate_share(&r2.share, &self.base.uid) {
                    return Err(abort(2, AbortReason::VssShareBad, Some(uid_j)));
                }
                new_sk = new_sk + &r2.share;
            }
            self.temp.new_sk = Some(new_sk);
        }

        let msg = ReshareRound4Message { pk };
        self.temp.r4[own_union] = Some(msg.clone());
        info!(session = %self.base.session_id, "reshare round 4: key reassembled");
        self.base.broadcast(ReshareMessage::R4(msg))
    }

    fn store(&mut self, msg: Incoming<ReshareMessage>) {
        if let ReshareMessage::R4(body) = msg.payload {
            if let Some(j) = index_of(&self.ctx.union_ids, &msg.from_uid) {
                store_slot(&mut self.temp.r4, j, &body);
            }
        }
    }
}

impl Round5 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(5)?;

        for (j, uid_j) in self.ctx.union_ids.iter().enumerate() {
            let r4 = self.temp.r4[j].as_ref().ok_or_else(|| missing("round 4 message"))?;
            if r4.pk != self.ctx.expected_pk {
                return Err(abort(4, AbortReason::AggregatePkDisagreement, Some(uid_j)));
            }
        }

        let own_new = match new_pos(&self.ctx, &self.base.uid) {
            Some(pos) => pos,
            None => {
                info!(session = %self.base.session_id, "reshare complete, share donated");
                return self.base.finish(None);
            }
        };

        let mut paillier_pks = Vec::with_capacity(self.ctx.new_ids.len());
        let mut ntilde = Vec::with_capacity(self.ctx.new_ids.len());
        for j in 0..self.ctx.new_ids.len() {
            let r3 = self.temp.r3[j].as_ref().ok_or_else(|| missing("round 3 message"))?;
            paillier_pks.push(r3.paillier_pk.clone());
            ntilde.push(r3.ntilde.ntilde.clone());
        }

        let mut vss_commits = Vec::with_capacity(self.ctx.old_ids.len());
        for j in 0..self.ctx.old_ids.len() {
            let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
            vss_commits.push(r1.commitments.clone());
        }

        let save = KeygenSaveData {
            sk_u: self.temp.new_sk.clone().ok_or_else(|| missing("reassembled share"))?,
            pk: self.ctx.expected_pk.clone(),
            paillier_sk: self.temp.paillier_sk.clone().ok_or_else(|| missing("paillier sk"))?,
            paillier_pks,
            ntilde,
            vss_commits,
            ids: self.ctx.new_ids.clone(),
            cur_index: own_new,
            threshold: self.ctx.new_threshold,
            uid_to_node: self.ctx.uid_to_node.clone(),
        };

        info!(session = %self.base.session_id, "reshare complete, fresh share assembled");
        self.base.finish(Some(save))
    }
}

impl MpcRound for ReshareRound {
    type Msg = ReshareMessage;
    type Output = ReshareOutput;

    fn number(&self) -> u32 {
        match self {
            ReshareRound::R0(_) => 0,
            ReshareRound::R1(_) => 1,
            ReshareRound::R2(_) => 2,
            ReshareRound::R3(_) => 3,
            ReshareRound::R4(_) => 4,
            ReshareRound::R5(_) => 5,
        }
    }

    fn start(&mut self) -> MpcResult<()> {
        match self {
            ReshareRound::R0(r) => r.start(),
            ReshareRound::R1(r) => r.start(),
            ReshareRound::R2(r) => r.start(),
            ReshareRound::R3(r) => r.start(),
            ReshareRound::R4(r) => r.start(),
            ReshareRound::R5(r) => r.start(),
        }
    }

    fn can_accept(&self, msg: &Incoming<ReshareMessage>) -> bool {
        match (self, &msg.payload) {
            (ReshareRound::R0(_), ReshareMessage::R0(_)) => msg.is_broadcast,
            (ReshareRound::R1(_), ReshareMessage::R1(_)) => msg.is_broadcast,
            (ReshareRound::R2(_), ReshareMessage::R2(_)) => !msg.is_broadcast,
            (ReshareRound::R3(_), ReshareMessage::R3(_)) => msg.is_broadcast,
            (ReshareRound::R4(_), ReshareMessage::R4(_)) => msg.is_broadcast,
            _ => false,
        }
    }

    fn store_message(&mut self, msg: Incoming<ReshareMessage>) -> MpcResult<()> {
        match self {
            ReshareRound::R0(r) => r.store(msg),
            ReshareRound::R1(r) => r.store(msg),
            ReshareRound::R2(r) => r.store(msg),
            ReshareRound::R3(r) => r.store(msg),
            ReshareRound::R4(r) => r.store(msg),
            ReshareRound::R5(_) => {}
        }
        Ok(())
    }

    fn update(&mut self) -> MpcResult<bool> {
        Ok(match self {
            ReshareRound::R0(r) => r.base.all_ok(),
            ReshareRound::R1(r) => slots_ok(&mut r.base, &r.temp.r1),
            ReshareRound::R2(r) => {
                if r.ctx.is_new(&r.base.uid) {
                    slots_ok(&mut r.base, &r.temp.r2)
                } else {
                    true
                }
            }
            ReshareRound::R3(r) => slots_ok(&mut r.base, &r.temp.r3),
            ReshareRound::R4(r) => slots_ok(&mut r.base, &r.temp.r4),
            ReshareRound::R5(_) => false,
        })
    }

    fn next_round(self) -> Option<Self> {
        match self {
            ReshareRound::R0(r) => Some(ReshareRound::R1(r.next())),
            ReshareRound::R1(r) => {
                let expected = if r.ctx.is_new(&r.base.uid) { r.ctx.old_ids.len() } else { 0 };
                Some(ReshareRound::R2(Round2 {
                    base: r.base.advance(2, expected),
                    ctx: r.ctx,
                    temp: r.temp,
                }))
            }
            ReshareRound::R2(r) => {
                let expected = r.ctx.new_ids.len();
                Some(ReshareRound::R3(Round3 {
                    base: r.base.advance(3, expected),
                    ctx: r.ctx,
                    temp: r.temp,
                }))
            }
            ReshareRound::R3(r) => {
                let expected = r.ctx.union_ids.len();
                Some(ReshareRound::R4(Round4 {
                    base: r.base.advance(4, expected),
                    ctx: r.ctx,
                    temp: r.temp,
                }))
            }
            ReshareRound::R4(r) => Some(ReshareRound::R5(Round5 {
                base: r.base.advance(5, 0),
                ctx: r.ctx,
                temp: r.temp,
            })),
            ReshareRound::R5(_) => None,
        }
    }

    fn waiting_for(&self) -> Vec<String> {
        let (base, ids): (&RsBase, &Vec<BigInt>) = match self {
            ReshareRound::R0(r) => (&r.base, &r.ctx.union_ids),
            ReshareRound::R1(r) => (&r.base, &r.ctx.old_ids),
            ReshareRound::R2(r) => (&r.base, &r.ctx.old_ids),
            ReshareRound::R3(r) => (&r.base, &r.ctx.new_ids),
            ReshareRound::R4(r) => (&r.base, &r.ctx.union_ids),
            ReshareRound::R5(r) => (&r.base, &r.ctx.union_ids),
        };
        base.waiting_for()
            .into_iter()
            .filter_map(|j| ids.get(j).map(|uid| uid.to_str_radix(16)))
            .collect()
    }
}
