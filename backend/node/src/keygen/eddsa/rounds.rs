use crate::crypto::commit::{ self, Decommitment };
use crate::crypto::vss;
use crate::error::{ AbortReason, MpcError, MpcResult };
use crate::keygen::eddsa::messages::*;
use crate::keygen::eddsa::{ EdKeygenContext, EdKeygenSaveData };
use crate::party::index_of;
use crate::protocol::message::Incoming;
use crate::protocol::round::{ MpcRound, RoundBase };
use curv::arithmetic::Converter;
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Ed25519, Point, Scalar };
use std::sync::Arc;
use tracing::info;

type EdBase = RoundBase<EdKeygenMessage, EdKeygenSaveData>;

pub(crate) struct EdKeygenTemp {
    u_i: Option<Scalar<Ed25519>>,
    own_decommit: Option<Decommitment>,
    sk_u: Option<Scalar<Ed25519>>,
    pk: Option<Point<Ed25519>>,
    r1: Vec<Option<EdKGRound1Message>>,
    r2_shares: Vec<Option<EdKGRound2Message1>>,
    r2_commits: Vec<Option<EdKGRound2Message2>>,
    r3: Vec<Option<EdKGRound3Message>>,
    r4: Vec<Option<EdKGRound4Message>>,
    r5: Vec<Option<EdKGRound5Message>>,
}

impl EdKeygenTemp {
    fn new(n: usize) -> Self {
        EdKeygenTemp {
            u_i: None,
            own_decommit: None,
            sk_u: None,
            pk: None,
            r1: vec![None; n],
            r2_shares: vec![None; n],
            r2_commits: vec![None; n],
            r3: vec![None; n],
            r4: vec![None; n],
            r5: vec![None; n],
        }
    }
}

fn missing(what: &str) -> MpcError {
    MpcError::InternalInvariantViolated(format!("missing {what}"))
}

fn slots_ok<T>(base: &mut EdBase, slots: &[Option<T>]) -> bool {
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

macro_rules! ed_keygen_round {
    ($name:ident) => {
        pub struct $name {
            base: EdBase,
            ctx: Arc<EdKeygenContext>,
            temp: Box<EdKeygenTemp>,
        }
    };
}

ed_keygen_round!(Round0);
ed_keygen_round!(Round1);
ed_keygen_round!(Round2);
ed_keygen_round!(Round3);
ed_keygen_round!(Round4);
ed_keygen_round!(Round5);
ed_keygen_round!(Round6);

/// Ed25519 keygen: the ECDSA flow without the Paillier/Ntilde step.
/// `Round0 -> ... -> Round6 (terminal)`.
pub enum EdKeygenRound {
    R0(Round0),
    R1(Round1),
    R2(Round2),
    R3(Round3),
    R4(Round4),
    R5(Round5),
    R6(Round6),
}

impl EdKeygenRound {
    pub fn new(base: EdBase, ctx: Arc<EdKeygenContext>) -> Self {
        let n = ctx.ids.len();
        EdKeygenRound::R0(Round0 { base, ctx, temp: Box::new(EdKeygenTemp::new(n)) })
    }
}

impl Round0 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(0)?;
        let pos = index_of(&self.ctx.ids, &self.base.uid).ok_or_else(|| {
            MpcError::BadInput("own uid is not part of the group".into())
        })?;
        self.base.ok[pos] = true;
        info!(session = %self.base.session_id, "ed keygen round 0: announcing presence");
        self.base.broadcast(EdKeygenMessage::R0(EdKGRound0Message { uid: self.base.uid.clone() }))
    }

    fn store(&mut self, msg: Incoming<EdKeygenMessage>) {
        if let EdKeygenMessage::R0(body) = msg.payload {
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

        let u_i = Scalar::<Ed25519>::random();
        let u_point = Point::generator() * &u_i;
        let (commitment, decommit) = commit::commit(&u_point.to_bytes(true));

        let msg = EdKGRound1Message { commitment };
        self.temp.u_i = Some(u_i);
        self.temp.own_decommit = Some(decommit);
        self.temp.r1[i] = Some(msg.clone());
        self.base.broadcast(EdKeygenMessage::R1(msg))
    }

    fn store(&mut self, msg: Incoming<EdKeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let EdKeygenMessage::R1(body) = msg.payload {
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
                self.temp.r2_shares[i] = Some(EdKGRound2Message1 { share: shares[i].clone() });
                continue;
            }
            self.base.unicast(
                uid.clone(),
                EdKeygenMessage::R2Share(EdKGRound2Message1 { share: shares[j].clone() })
            )?;
        }

        let commit_msg = EdKGRound2Message2 { commitments };
        self.temp.r2_commits[i] = Some(commit_msg.clone());
        self.base.broadcast(EdKeygenMessage::R2Commit(commit_msg))
    }

    fn store(&mut self, msg: Incoming<EdKeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            match msg.payload {
                EdKeygenMessage::R2Share(body) => store_slot(&mut self.temp.r2_shares, j, &body),
                EdKeygenMessage::R2Commit(body) => store_slot(&mut self.temp.r2_commits, j, &body),
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

        let msg = EdKGRound3Message { decommit, dlog_proof: DLogProof::prove(&u_i) };
        self.temp.r3[i] = Some(msg.clone());
        self.base.broadcast(EdKeygenMessage::R3(msg))
    }

    fn store(&mut self, msg: Incoming<EdKeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let EdKeygenMessage::R3(body) = msg.payload {
                store_slot(&mut self.temp.r3, j, &body);
            }
        }
    }
}

impl Round4 {
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

        let mut sk_u = Scalar::<Ed25519>::zero();
        let mut pk = Point::<Ed25519>::zero();

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

        let msg = EdKGRound4Message { verified: true };
        self.temp.r4[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "ed keygen round 4: all peers verified");
        self.base.broadcast(EdKeygenMessage::R4(msg))
    }

    fn store(&mut self, msg: Incoming<EdKeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let EdKeygenMessage::R4(body) = msg.payload {
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

        let msg = EdKGRound5Message { pk };
        self.temp.r5[i] = Some(msg.clone());
        self.base.broadcast(EdKeygenMessage::R5(msg))
    }

    fn store(&mut self, msg: Incoming<EdKeygenMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.ids, &msg) {
            if let EdKeygenMessage::R5(body) = msg.payload {
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

        let mut vss_commits = Vec::with_capacity(self.base.dnode_count);
        for j in 0..self.base.dnode_count {
            let r2 = self.temp.r2_commits[j].as_ref().ok_or_else(|| missing("commitments"))?;
            vss_commits.push(r2.commitments.clone());
        }

        let save = EdKeygenSaveData {
            sk_u: self.temp.sk_u.clone().ok_or_else(|| missing("share"))?,
            pk: own_pk,
            vss_commits,
            ids: self.ctx.ids.clone(),
            cur_index: i,
            threshold: self.base.threshold,
            uid_to_node: self.ctx.uid_to_node.clone(),
        };

        info!(session = %self.base.session_id, "ed keygen complete");
        self.base.finish(save)
    }
}

impl MpcRound for EdKeygenRound {
    type Msg = EdKeygenMessage;
    type Output = EdKeygenSaveData;

    fn number(&self) -> u32 {
        match self {
            EdKeygenRound::R0(_) => 0,
            EdKeygenRound::R1(_) => 1,
            EdKeygenRound::R2(_) => 2,
            EdKeygenRound::R3(_) => 3,
            EdKeygenRound::R4(_) => 4,
            EdKeygenRound::R5(_) => 5,
            EdKeygenRound::R6(_) => 6,
        }
    }

    fn start(&mut self) -> MpcResult<()> {
        match self {
            EdKeygenRound::R0(r) => r.start(),
            EdKeygenRound::R1(r) => r.start(),
            EdKeygenRound::R2(r) => r.start(),
            EdKeygenRound::R3(r) => r.start(),
            EdKeygenRound::R4(r) => r.start(),
            EdKeygenRound::R5(r) => r.start(),
            EdKeygenRound::R6(r) => r.start(),
        }
    }

    fn can_accept(&self, msg: &Incoming<EdKeygenMessage>) -> bool {
        match (self, &msg.payload) {
            (EdKeygenRound::R0(_), EdKeygenMessage::R0(_)) => msg.is_broadcast,
            (EdKeygenRound::R1(_), EdKeygenMessage::R1(_)) => msg.is_broadcast,
            (EdKeygenRound::R2(_), EdKeygenMessage::R2Share(_)) => !msg.is_broadcast,
            (EdKeygenRound::R2(_), EdKeygenMessage::R2Commit(_)) => msg.is_broadcast,
            (EdKeygenRound::R3(_), EdKeygenMessage::R3(_)) => msg.is_broadcast,
            (EdKeygenRound::R4(_), EdKeygenMessage::R4(_)) => msg.is_broadcast,
            (EdKeygenRound::R5(_), EdKeygenMessage::R5(_)) => msg.is_broadcast,
            _ => false,
        }
    }

    fn store_message(&mut self, msg: Incoming<EdKeygenMessage>) -> MpcResult<()> {
        match self {
            EdKeygenRound::R0(r) => r.store(msg),
            EdKeygenRound::R1(r) => r.store(msg),
            EdKeygenRound::R2(r) => r.store(msg),
            EdKeygenRound::R3(r) => r.store(msg),
            EdKeygenRound::R4(r) => r.store(msg),
            EdKeygenRound::R5(r) => r.store(msg),
            EdKeygenRound::R6(_) => {}
        }
        Ok(())
    }

    fn update(&mut self) -> MpcResult<bool> {
        Ok(match self {
            EdKeygenRound::R0(r) => r.base.all_ok(),
            EdKeygenRound::R1(r) => slots_ok(&mut r.base, &r.temp.r1),
            EdKeygenRound::R2(r) => r.update(),
            EdKeygenRound::R3(r) => slots_ok(&mut r.base, &r.temp.r3),
            EdKeygenRound::R4(r) => slots_ok(&mut r.base, &r.temp.r4),
            EdKeygenRound::R5(r) => slots_ok(&mut r.base, &r.temp.r5),
            EdKeygenRound::R6(_) => false,
        })
    }

    fn next_round(self) -> Option<Self> {
        match self {
            EdKeygenRound::R0(r) => Some(EdKeygenRound::R1(r.next())),
            EdKeygenRound::R1(r) => {
                let n = r.ctx.ids.len();
                Some(EdKeygenRound::R2(Round2 { base: r.base.advance(2, n), ctx: r.ctx, temp: r.temp }))
            }
            EdKeygenRound::R2(r) => {
                let n = r.ctx.ids.len();
                Some(EdKeygenRound::R3(Round3 { base: r.base.advance(3, n), ctx: r.ctx, temp: r.temp }))
            }
            EdKeygenRound::R3(r) => {
                let n = r.ctx.ids.len();
                Some(EdKeygenRound::R4(Round4 { base: r.base.advance(4, n), ctx: r.ctx, temp: r.temp }))
            }
            EdKeygenRound::R4(r) => {
                let n = r.ctx.ids.len();
                Some(EdKeygenRound::R5(Round5 { base: r.base.advance(5, n), ctx: r.ctx, temp: r.temp }))
            }
            EdKeygenRound::R5(r) => {
                let n = r.ctx.ids.len();
                Some(EdKeygenRound::R6(Round6 { base: r.base.advance(6, n), ctx: r.ctx, temp: r.temp }))
            }
            EdKeygenRound::R6(_) => None,
        }
    }

    fn waiting_for(&self) -> Vec<String> {
        let (base, ids) = match self {
            EdKeygenRound::R0(r) => (&r.base, &r.ctx.ids),
            EdKeygenRound::R1(r) => (&r.base, &r.ctx.ids),
            EdKeygenRound::R2(r) => (&r.base, &r.ctx.ids),
            EdKeygenRound::R3(r) => (&r.base, &r.ctx.ids),
            EdKeygenRound::R4(r) => (&r.base, &r.ctx.ids),
            EdKeygenRound::R5(r) => (&r.base, &r.ctx.ids),
            EdKeygenRound::R6(r) => (&r.base, &r.ctx.ids),
        };
        base.waiting_for()
            .into_iter()
            .filter_map(|j| ids.get(j).map(|uid| uid.to_str_radix(16)))
            .collect()
    }
}
