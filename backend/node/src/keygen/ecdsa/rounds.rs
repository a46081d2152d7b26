use crate::crypto::commit::{ self, Decommitment };
use crate::crypto::ntilde::generate_ntilde;
use crate::crypto::paillier;
use crate::crypto::vss::{ self, FeldmanCommitments };
use crate::error::{ AbortReason, FaultKind, MpcError, MpcResult };
use crate::keygen::ecdsa::messages::*;
use crate::keygen::ecdsa::{ KeygenContext, KeygenSaveData };
use crate::party::index_of;
use crate::protocol::message::Incoming;
use crate::protocol::round::{ MpcRound, RoundBase };
use curv::arithmetic::{ BitManipulation, Converter };
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use std::sync::Arc;
use tracing::info;

type KgBase = RoundBase<KeygenMessage, KeygenSaveData>;

/// Scratch state threaded through the rounds. Message slots are indexed by
/// the sorted-uid position of the sender; a slot is written at most once, so
/// duplicate deliveries cannot change state.
pub(crate) struct KeygenTemp {
    u_i: Option<Scalar<Secp256k1>>,
    own_decommit: Option<Decommitment>,
    paillier_sk: Option<paillier::PrivateKey>,
    sk_u: Option<Scalar<Secp256k1>>,
    pk: Option<Point<Secp256k1>>,
    r1: Vec<Option<KGRound1Message>>,
    r2_shares: Vec<Option<KGRound2Message1>>,
    r2_commits: Vec<Option<KGRound2Message2>>,
    r3: Vec<Option<KGRound3Message>>,
    r4: Vec<Option<KGRound4Message>>,
    r5: Vec<Option<KGRound5Message>>,
    r6: Vec<Option<KGRound6Message>>,
}

impl KeygenTemp {
    fn new(n: usize) -> Self {
        KeygenTemp {
            u_i: None,
            own_decommit: None,
            paillier_sk: None,
            sk_u: None,
            pk: None,
            r1: vec![None; n],
            r2_shares: vec![None; n],
            r2_commits: vec![None; n],
            r3: vec![None; n],
            r4: vec![None; n],
            r5: vec![None; n],
            r6: vec![None; n],
        }
    }
}

fn missing(what: &str) -> MpcError {
    MpcError::InternalInvariantViolated(format!("missing {what}"))
}

fn slots_ok<T>(base: &mut KgBase, slots: &[Option<T>]) -> bool {
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

macro_rules! keygen_round {
    ($name:ident) => {
        pub struct $name {
            base: KgBase,
            ctx: Arc<KeygenContext>,
            temp: Box<KeygenTemp>,
        }
    };
}

keygen_round!(Round0);
keygen_round!(Round1);
keygen_round!(Round2);
keygen_round!(Round3);
keygen_round!(Round4);
keygen_round!(Round5);
keygen_round!(Round6);
keygen_round!(Round7);

/// The ECDSA keygen state machine: `Round0 -> ... -> Round7 (terminal)`.
pub enum EcdsaKeygenRound {
    R0(Round0),
    R1(Round1),
    R2(Round2),
    R3(Round3),
    R4(Round4),
    R5(Round5),
    R6(Round6),
    R7(Round7),
}

impl EcdsaKeygenRound {
    pub fn new(base: KgBase, ctx: Arc<KeygenContext>) -> Self {
        let n = ctx.ids.len();
        EcdsaKeygenRound::R0(Round0 { base, ctx, temp: Box::new(KeygenTemp::new(n)) })
    }
}

impl Round0 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(0)?;
        let pos = index_of(&self.ctx.ids, &self.base.uid).ok_or_else(|| {
            MpcError::BadInput("own uid is not part of the group".into())
        })?;
        self.base.ok[pos] = true;
        info!(session = %self.base.session_id, "keygen round 0: announcing presence");
        self.base.broadcast(KeygenMessage::R0(KGRound0Message { uid: self.base.uid.clone() }))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let KeygenMessage::R0(body) = msg.payload {
            if body.uid != msg.from_uid {
                return;
            }
            if let Some(pos) = index_of(&self.ctx.ids, &body.uid) {
                self.base.ok[pos] = true;
            }
        }
    }

    fn next(self) -> Round1 {
        let n = self.ctx.ids.len();
        let index = index_of(&self.ctx.ids, &self.base.uid).expect("own uid checked in round 0");
        let mut base = self.base.advance(1, n);
        base.index = index as i32;
        Round1 { base, ctx: self.ctx, temp: self.temp }
    }
}

impl Round1 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(1)?;
        let i = self.base.index as usize;

        let u_i = Scalar::<Secp256k1>::random();
        let (paillier_pk, paillier_sk) =
            paillier::generate_key_pair(self.base.paillier_bits, &self.ctx.pool);
        let ntilde = generate_ntilde(self.base.ntilde_bits, &self.ctx.pool);
        let fact_proof = paillier_sk.zk_fact_prove();

        let u_point = Point::generator() * &u_i;
        let (commitment, decommit) = commit::commit(&u_point.to_bytes(true));

        let msg = KGRound1Message { paillier_pk, ntilde, fact_proof, commitment };
        self.temp.u_i = Some(u_i);
        self.temp.own_decommit = Some(decommit);
        self.temp.paillier_sk = Some(paillier_sk);
        self.temp.r1[i] = Some(msg.clone());

        info!(session = %self.base.session_id, "keygen round 1: paillier and ntilde ready");
        self.base.broadcast(KeygenMessage::R1(msg))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let KeygenMessage::R1(body) = msg.payload {
                store_slot(&mut self.temp.r1, j, &body);
            }
        }
    }
}

impl Round2 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(2)?;
        let i = self.base.index as usize;
        let u_i = self.temp.u_i.clone().ok_or_else(|| missing("u_i"))?;

        let (commitments, shares) = vss::share(&u_i, self.base.threshold, &self.ctx.ids);

        for (j, uid) in self.ctx.ids.iter().enumerate() {
            if j == i {
                self.temp.r2_shares[i] = Some(KGRound2Message1 { share: shares[i].clone() });
                continue;
            }
            self.base.unicast(
                uid.clone(),
                KeygenMessage::R2Share(KGRound2Message1 { share: shares[j].clone() })
            )?;
        }

        let commit_msg = KGRound2Message2 { commitments };
        self.temp.r2_commits[i] = Some(commit_msg.clone());
        self.base.broadcast(KeygenMessage::R2Commit(commit_msg))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            match msg.payload {
                KeygenMessage::R2Share(body) => store_slot(&mut self.temp.r2_shares, j, &body),
                KeygenMessage::R2Commit(body) => store_slot(&mut self.temp.r2_commits, j, &body),
                _ => {}
            }
        }
    }

    fn update(&mut self) -> bool {
        for j in 0..self.base.dnode_count {
            self.base.ok[j] = self.temp.r2_shares[j].is_some() && self.temp.r2_commits[j].is_some();
        }
        self.base.all_ok()
    }
}

impl Round3 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(3)?;
        let i = self.base.index as usize;
        let u_i = self.temp.u_i.clone().ok_or_else(|| missing("u_i"))?;
        let decommit = self.temp.own_decommit.clone().ok_or_else(|| missing("decommitment"))?;

        let msg = KGRound3Message { decommit, dlog_proof: DLogProof::prove(&u_i) };
        self.temp.r3[i] = Some(msg.clone());
        self.base.broadcast(KeygenMessage::R3(msg))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let KeygenMessage::R3(body) = msg.payload {
                store_slot(&mut self.temp.r3, j, &body);
            }
        }
    }
}

impl Round4 {
    /// The verification round: every artifact received in rounds 1..3 is
    /// checked here, before any derived state is kept. Failures name the
    /// round of the offending message and the offender.
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(4)?;
        let i = self.base.index as usize;
        let own_uid = self.base.uid.clone();

        let abort = |round: u32, reason: AbortReason, offender: &curv::BigInt| {
            MpcError::ProtocolAborted {
                round,
                reason,
                offender: Some(offender.to_str_radix(16)),
            }
        };
        let fault = |kind: FaultKind, offender: &curv::BigInt| MpcError::PeerFaulted {
            uid: offender.to_str_radix(16),
            kind,
        };

        let mut sk_u = Scalar::<Secp256k1>::zero();
        let mut pk = Point::<Secp256k1>::zero();

        for (j, uid_j) in self.ctx.ids.iter().enumerate() {
            let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
            let r2_share = self.temp.r2_shares[j].as_ref().ok_or_else(|| missing("share"))?;
            let r2_commit = self.temp.r2_commits[j]
                .as_ref()
                .ok_or_else(|| missing("vss commitments"))?;

            let u_point = if j == i {
                let u_i = self.temp.u_i.as_ref().ok_or_else(|| missing("u_i"))?;
                Point::generator() * u_i
            } else {
                let r3 = self.temp.r3[j].as_ref().ok_or_else(|| missing("decommitment"))?;

                let opened = commit::verify(&r1.commitment, &r3.decommit).ok_or_else(|| {
                    abort(3, AbortReason::CommitMismatch, uid_j)
                })?;
                let u_point = Point::from_bytes(&opened).map_err(|_| {
                    abort(3, AbortReason::CommitMismatch, uid_j)
                })?;

                if DLogProof::verify(&r3.dlog_proof).is_err() || r3.dlog_proof.pk != u_point {
                    return Err(abort(3, AbortReason::SchnorrProofBad, uid_j));
                }

                if !r1.ntilde.verify() {
                    return Err(fault(FaultKind::NtildeProofBad, uid_j));
                }
                if r1.paillier_pk.n.bit_length() + 2 < self.base.paillier_bits
                    || !r1.paillier_pk.zk_fact_verify(&r1.fact_proof)
                {
                    return Err(fault(FaultKind::PaillierProofBad, uid_j));
                }
                u_point
            };

            let commitments = &r2_commit.commitments;
            if commitments.threshold != self.base.threshold
                || commitments.commitments.len() != self.base.threshold + 1
                || commitments.secret_commitment() != Some(&u_point)
                || !commitments.validate_share(&r2_share.share, &own_uid)
            {
                return Err(abort(2, AbortReason::VssShareBad, uid_j));
            }

            sk_u = sk_u + &r2_share.share;
            pk = pk + &u_point;
        }

        self.temp.sk_u = Some(sk_u);
        self.temp.pk = Some(pk);

        let msg = KGRound4Message { verified: true };
        self.temp.r4[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "keygen round 4: all peers verified");
        self.base.broadcast(KeygenMessage::R4(msg))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let KeygenMessage::R4(body) = msg.payload {
                store_slot(&mut self.temp.r4, j, &body);
            }
        }
    }
}

impl Round5 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(5)?;
        let i = self.base.index as usize;
        let pk = self.temp.pk.clone().ok_or_else(|| missing("aggregate pk"))?;

        let msg = KGRound5Message { pk };
        self.temp.r5[i] = Some(msg.clone());
        self.base.broadcast(KeygenMessage::R5(msg))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let KeygenMessage::R5(body) = msg.payload {
                store_slot(&mut self.temp.r5, j, &body);
            }
        }
    }
}

impl Round6 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(6)?;
        let i = self.base.index as usize;
        let own_pk = self.temp.pk.clone().ok_or_else(|| missing("aggregate pk"))?;

        for (j, uid_j) in self.ctx.ids.iter().enumerate() {
            let r5 = self.temp.r5[j].as_ref().ok_or_else(|| missing("round 5 message"))?;
            if r5.pk != own_pk {
                return Err(MpcError::ProtocolAborted {
                    round: 5,
                    reason: AbortReason::AggregatePkDisagreement,
                    offender: Some(uid_j.to_str_radix(16)),
                });
            }
        }

        let msg = KGRound6Message { agree: true };
        self.temp.r6[i] = Some(msg.clone());
        self.base.broadcast(KeygenMessage::R6(msg))
    }

    fn store(&mut self, msg: Incoming<KeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let KeygenMessage::R6(body) = msg.payload {
                store_slot(&mut self.temp.r6, j, &body);
            }
        }
    }
}

impl Round7 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(7)?;
        let i = self.base.index as usize;

        let mut paillier_pks = Vec::with_capacity(self.base.dnode_count);
        let mut ntilde = Vec::with_capacity(self.base.dnode_count);
        let mut vss_commits = Vec::with_capacity(self.base.dnode_count);
        for j in 0..self.base.dnode_count {
            let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
            let r2 = self.temp.r2_commits[j].as_ref().ok_or_else(|| missing("commitments"))?;
            paillier_pks.push(r1.paillier_pk.clone());
            ntilde.push(r1.ntilde.ntilde.clone());
            vss_commits.push(r2.commitments.clone());
        }

        let save = KeygenSaveData {
            sk_u: self.temp.sk_u.clone().ok_or_else(|| missing("share"))?,
            pk: self.temp.pk.clone().ok_or_else(|| missing("aggregate pk"))?,
            paillier_sk: self.temp.paillier_sk.clone().ok_or_else(|| missing("paillier sk"))?,
            paillier_pks,
            ntilde,
            vss_commits,
            ids: self.ctx.ids.clone(),
            cur_index: i,
            threshold: self.base.threshold,
            uid_to_node: self.ctx.uid_to_node.clone(),
        };

        info!(session = %self.base.session_id, "keygen complete");
        self.base.finish(save)
    }
}

impl MpcRound for EcdsaKeygenRound {
    type Msg = KeygenMessage;
    type Output = KeygenSaveData;

    fn number(&self) -> u32 {
        match self {
            EcdsaKeygenRound::R0(_) => 0,
            EcdsaKeygenRound::R1(_) => 1,
            EcdsaKeygenRound::R2(_) => 2,
            EcdsaKeygenRound::R3(_) => 3,
            EcdsaKeygenRound::R4(_) => 4,
            EcdsaKeygenRound::R5(_) => 5,
            EcdsaKeygenRound::R6(_) => 6,
            EcdsaKeygenRound::R7(_) => 7,
        }
    }

    fn start(&mut self) -> MpcResult<()> {
        match self {
            EcdsaKeygenRound::R0(r) => r.start(),
            EcdsaKeygenRound::R1(r) => r.start(),
            EcdsaKeygenRound::R2(r) => r.start(),
            EcdsaKeygenRound::R3(r) => r.start(),
            EcdsaKeygenRound::R4(r) => r.start(),
            EcdsaKeygenRound::R5(r) => r.start(),
            EcdsaKeygenRound::R6(r) => r.start(),
            EcdsaKeygenRound::R7(r) => r.start(),
        }
    }

    fn can_accept(&self, msg: &Incoming<KeygenMessage>) -> bool {
        match (self, &msg.payload) {
            (EcdsaKeygenRound::R0(_), KeygenMessage::R0(_)) => msg.is_broadcast,
            (EcdsaKeygenRound::R1(_), KeygenMessage::R1(_)) => msg.is_broadcast,
            (EcdsaKeygenRound::R2(_), KeygenMessage::R2Share(_)) => !msg.is_broadcast,
            (EcdsaKeygenRound::R2(_), KeygenMessage::R2Commit(_)) => msg.is_broadcast,
            (EcdsaKeygenRound::R3(_), KeygenMessage::R3(_)) => msg.is_broadcast,
            (EcdsaKeygenRound::R4(_), KeygenMessage::R4(_)) => msg.is_broadcast,
            (EcdsaKeygenRound::R5(_), KeygenMessage::R5(_)) => msg.is_broadcast,
            (EcdsaKeygenRound::R6(_), KeygenMessage::R6(_)) => msg.is_broadcast,
            _ => false,
        }
    }

    fn store_message(&mut self, msg: Incoming<KeygenMessage>) -> MpcResult<()> {
        match self {
            EcdsaKeygenRound::R0(r) => r.store(msg),
            EcdsaKeygenRound::R1(r) => r.store(msg),
            EcdsaKeygenRound::R2(r) => r.store(msg),
            EcdsaKeygenRound::R3(r) => r.store(msg),
            EcdsaKeygenRound::R4(r) => r.store(msg),
            EcdsaKeygenRound::R5(r) => r.store(msg),
            EcdsaKeygenRound::R6(r) => r.store(msg),
            EcdsaKeygenRound::R7(_) => {}
        }
        Ok(())
    }

    fn update(&mut self) -> MpcResult<bool> {
        Ok(match self {
            EcdsaKeygenRound::R0(r) => r.base.all_ok(),
            EcdsaKeygenRound::R1(r) => slots_ok(&mut r.base, &r.temp.r1),
            EcdsaKeygenRound::R2(r) => r.update(),
            EcdsaKeygenRound::R3(r) => slots_ok(&mut r.base, &r.temp.r3),
            EcdsaKeygenRound::R4(r) => slots_ok(&mut r.base, &r.temp.r4),
            EcdsaKeygenRound::R5(r) => slots_ok(&mut r.base, &r.temp.r5),
            EcdsaKeygenRound::R6(r) => slots_ok(&mut r.base, &r.temp.r6),
            EcdsaKeygenRound::R7(_) => false,
        })
    }

    fn next_round(self) -> Option<Self> {
        let n = match &self {
            EcdsaKeygenRound::R0(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R1(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R2(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R3(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R4(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R5(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R6(r) => r.ctx.ids.len(),
            EcdsaKeygenRound::R7(_) => 0,
        };
        match self {
            EcdsaKeygenRound::R0(r) => Some(EcdsaKeygenRound::R1(r.next())),
            EcdsaKeygenRound::R1(r) => Some(EcdsaKeygenRound::R2(Round2 {
                base: r.base.advance(2, n),
                ctx: r.ctx,
                temp: r.temp,
            })),
            EcdsaKeygenRound::R2(r) => Some(EcdsaKeygenRound::R3(Round3 {
                base: r.base.advance(3, n),
                ctx: r.ctx,
                temp: r.temp,
            })),
            EcdsaKeygenRound::R3(r) => Some(EcdsaKeygenRound::R4(Round4 {
                base: r.base.advance(4, n),
                ctx: r.ctx,
                temp: r.temp,
            })),
            EcdsaKeygenRound::R4(r) => Some(EcdsaKeygenRound::R5(Round5 {
                base: r.base.advance(5, n),
                ctx: r.ctx,
                temp: r.temp,
            })),
            EcdsaKeygenRound::R5(r) => Some(EcdsaKeygenRound::R6(Round6 {
                base: r.base.advance(6, n),
                ctx: r.ctx,
                temp: r.temp,
            })),
            EcdsaKeygenRound::R6(r) => Some(EcdsaKeygenRound::R7(Round7 {
                base: r.base.advance(7, n),
                ctx: r.ctx,
                temp: r.temp,
            })),
            EcdsaKeygenRound::R7(_) => None,
        }
    }

    fn waiting_for(&self) -> Vec<String> {
        let (base, ids) = match self {
            EcdsaKeygenRound::R0(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R1(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R2(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R3(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R4(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R5(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R6(r) => (&r.base, &r.ctx.ids),
            EcdsaKeygenRound::R7(r) => (&r.base, &r.ctx.ids),
        };
        base.waiting_for()
            .into_iter()
            .filter_map(|j| ids.get(j).map(|uid| uid.to_str_radix(16)))
            .collect()
    }
}
