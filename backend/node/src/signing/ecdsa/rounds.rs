use crate::crypto::commit::{ self, Decommitment };
use crate::crypto::mta::{ MessageA, MessageB };
use crate::crypto::zk::AltBaseDlogProof;
use crate::error::{ AbortReason, FaultKind, MpcError, MpcResult };
use crate::protocol::message::Incoming;
use crate::protocol::round::{ MpcRound, RoundBase };
use crate::signing::ecdsa::messages::*;
use crate::signing::ecdsa::{ scalar_to_32_bytes, PreSignData, SignContext, SignOutput, SignatureRecid };
use curv::arithmetic::{ BitManipulation, Converter, Integer };
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use std::sync::Arc;
use tracing::info;

type SgBase = RoundBase<SignMessage, SignOutput>;

pub(crate) struct SignTemp {
    w_i: Option<Scalar<Secp256k1>>,
    k_i: Option<Scalar<Secp256k1>>,
    gamma_i: Option<Scalar<Secp256k1>>,
    own_decommit: Option<Decommitment>,
    own_msg_a: Option<MessageA>,
    big_ws: Vec<Point<Secp256k1>>,
    betas: Vec<Option<Scalar<Secp256k1>>>,
    nus: Vec<Option<Scalar<Secp256k1>>>,
    delta_i: Option<Scalar<Secp256k1>>,
    sigma_i: Option<Scalar<Secp256k1>>,
    big_r: Option<Point<Secp256k1>>,
    r: Option<Scalar<Secp256k1>>,
    /// Set when this session finalizes a cached presign: rounds 1..6 never
    /// ran, so their checks are not re-run.
    finalize: bool,
    r1: Vec<Option<SignRound1Message>>,
    r2: Vec<Option<SignRound2Message>>,
    r3: Vec<Option<SignRound3Message>>,
    r4: Vec<Option<SignRound4Message>>,
    r5: Vec<Option<SignRound5Message>>,
    r6: Vec<Option<SignRound6Message>>,
    r7: Vec<Option<SignRound7Message>>,
}

impl SignTemp {
    fn new(n: usize) -> Self {
        SignTemp {
            w_i: None,
            k_i: None,
            gamma_i: None,
            own_decommit: None,
            own_msg_a: None,
            big_ws: Vec::new(),
            betas: vec![None; n],
            nus: vec![None; n],
            delta_i: None,
            sigma_i: None,
            big_r: None,
            r: None,
            finalize: false,
            r1: vec![None; n],
            r2: vec![None; n],
            r3: vec![None; n],
            r4: vec![None; n],
            r5: vec![None; n],
            r6: vec![None; n],
            r7: vec![None; n],
        }
    }
}

fn missing(what: &str) -> MpcError {
    MpcError::InternalInvariantViolated(format!("missing {what}"))
}

fn abort(round: u32, reason: AbortReason, offender: &BigInt) -> MpcError {
    MpcError::ProtocolAborted { round, reason, offender: Some(offender.to_str_radix(16)) }
}

fn fault(kind: FaultKind, offender: &BigInt) -> MpcError {
    MpcError::PeerFaulted { uid: offender.to_str_radix(16), kind }
}

fn slots_ok<T>(base: &mut SgBase, slots: &[Option<T>]) -> bool {
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

macro_rules! sign_round {
    ($name:ident) => {
        pub struct $name {
            base: SgBase,
            ctx: Arc<SignContext>,
            temp: Box<SignTemp>,
        }
    };
}

sign_round!(Round1);
sign_round!(Round2);
sign_round!(Round3);
sign_round!(Round4);
sign_round!(Round5);
sign_round!(Round6);
sign_round!(Round7);
sign_round!(RoundEnd);

/// The ECDSA signing state machine. A full signing runs
/// `R1 -> ... -> R7 -> End`; a presign session stops after `R6` and emits
/// the cached tuple; finalizing a cached tuple enters directly at `R7`.
pub enum EcdsaSignRound {
    R1(Round1),
    R2(Round2),
    R3(Round3),
    R4(Round4),
    R5(Round5),
    R6(Round6),
    R7(Round7),
    End(RoundEnd),
}

impl EcdsaSignRound {
    pub fn new(mut base: SgBase, ctx: Arc<SignContext>) -> MpcResult<Self> {
        let n = ctx.sign_ids.len();
        if n != ctx.save.threshold + 1 {
            return Err(
                MpcError::BadInput(
                    format!("signing set has {} members, quorum is {}", n, ctx.save.threshold + 1)
                )
            );
        }
        base.number = 1;
        Ok(EcdsaSignRound::R1(Round1 { base, ctx, temp: Box::new(SignTemp::new(n)) }))
    }

    /// Enter at the finalize exchange with material from a cached presign.
    pub fn new_finalize(
        mut base: SgBase,
        ctx: Arc<SignContext>,
        presign: PreSignData
    ) -> MpcResult<Self> {
        let n = ctx.sign_ids.len();
        if presign.sign_ids != ctx.sign_ids || presign.own_index != base.index as usize {
            return Err(MpcError::BadInput("presign tuple does not match the signing set".into()));
        }
        let mut temp = Box::new(SignTemp::new(n));
        temp.k_i = Some(presign.k_i);
        temp.sigma_i = Some(presign.sigma_i);
        temp.r = Some(presign.r);
        temp.big_r = Some(presign.big_r);
        temp.finalize = true;
        base.number = 7;
        Ok(EcdsaSignRound::R7(Round7 { base, ctx, temp }))
    }
}

impl Round1 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(1)?;
        let i = self.base.index as usize;

        let lambda = self.ctx.lagrange_for(i)?;
        let w_i = &self.ctx.save.sk_u * &lambda;

        let mut big_ws = Vec::with_capacity(self.base.dnode_count);
        for j in 0..self.base.dnode_count {
            big_ws.push(self.ctx.public_w(j)?);
        }

        let k_i = Scalar::<Secp256k1>::random();
        let gamma_i = Scalar::<Secp256k1>::random();
        let gamma_point = Point::generator() * &gamma_i;
        let (commitment, decommit) = commit::commit(&gamma_point.to_bytes(true));

        let receiver_ntildes: Vec<_> = (0..self.base.dnode_count)
            .map(|j| {
                self.ctx.keygen_index(j).map(|kj| self.ctx.save.ntilde[kj].clone())
            })
            .collect::<MpcResult<_>>()?;
        let (msg_a, _randomness) = MessageA::new(
            &k_i,
            &self.ctx.save.paillier_sk.pk,
            &receiver_ntildes
        )?;

        let msg = SignRound1Message { commitment, msg_a: msg_a.clone() };
        self.temp.w_i = Some(w_i);
        self.temp.k_i = Some(k_i);
        self.temp.gamma_i = Some(gamma_i);
        self.temp.own_decommit = Some(decommit);
        self.temp.own_msg_a = Some(msg_a);
        self.temp.big_ws = big_ws;
        self.temp.r1[i] = Some(msg.clone());

        info!(session = %self.base.session_id, "sign round 1: committed to gamma, sent MtA opener");
        self.base.broadcast(SignMessage::R1(msg))
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R1(body) = msg.payload {
                store_slot(&mut self.temp.r1, j, &body);
            }
        }
    }
}

impl Round2 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(2)?;
        let i = self.base.index as usize;
        let own_kg = self.ctx.keygen_index(i)?;
        let own_ntilde = self.ctx.save.ntilde[own_kg].clone();
        let gamma_i = self.temp.gamma_i.clone().ok_or_else(|| missing("gamma_i"))?;
        let w_i = self.temp.w_i.clone().ok_or_else(|| missing("w_i"))?;

        for j in 0..self.base.dnode_count {
            if j == i {
                continue;
            }
            let uid_j = &self.ctx.sign_ids[j];
            let kg_j = self.ctx.keygen_index(j)?;
            let ek_j = &self.ctx.save.paillier_pks[kg_j];
            let msg_a = &self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?.msg_a;

            // The opener's range proof is addressed per receiver; ours sits
            // at our signing position.
            if !msg_a.verify(ek_j, &own_ntilde, i) {
                return Err(fault(FaultKind::RangeProofBad, uid_j));
            }

            let ntilde_j = &self.ctx.save.ntilde[kg_j];
            let (mb_gamma, keep_gamma) = MessageB::new(&gamma_i, ek_j, ntilde_j, msg_a)?;
            let (mb_w, keep_w) = MessageB::new(&w_i, ek_j, ntilde_j, msg_a)?;
            self.temp.betas[j] = Some(keep_gamma.beta);
            self.temp.nus[j] = Some(keep_w.beta);

            self.base.unicast(uid_j.clone(), SignMessage::R2(SignRound2Message { mb_gamma, mb_w }))?;
        }
        Ok(())
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R2(body) = msg.payload {
                store_slot(&mut self.temp.r2, j, &body);
            }
        }
    }

    fn update(&mut self) -> bool {
        let i = self.base.index as usize;
        for j in 0..self.base.dnode_count {
            self.base.ok[j] = j == i || self.temp.r2[j].is_some();
        }
        self.base.all_ok()
    }
}

impl Round3 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(3)?;
        let i = self.base.index as usize;
        let own_kg = self.ctx.keygen_index(i)?;
        let own_ntilde = &self.ctx.save.ntilde[own_kg];
        let own_dk = &self.ctx.save.paillier_sk;
        let c_a = self.temp.own_msg_a.as_ref().ok_or_else(|| missing("own MtA opener"))?.c.clone();

        let k_i = self.temp.k_i.clone().ok_or_else(|| missing("k_i"))?;
        let gamma_i = self.temp.gamma_i.clone().ok_or_else(|| missing("gamma_i"))?;
        let w_i = self.temp.w_i.clone().ok_or_else(|| missing("w_i"))?;

        let mut delta_i = &k_i * &gamma_i;
        let mut sigma_i = &k_i * &w_i;

        for j in 0..self.base.dnode_count {
            if j == i {
                continue;
            }
            let uid_j = &self.ctx.sign_ids[j];
            let r2 = self.temp.r2[j].as_ref().ok_or_else(|| missing("round 2 message"))?;

            let alpha = r2.mb_gamma.verify_and_decrypt(own_dk, own_ntilde, &c_a, None, uid_j)?;
            let mu = r2.mb_w.verify_and_decrypt(
                own_dk,
                own_ntilde,
                &c_a,
                Some(&self.temp.big_ws[j]),
                uid_j
            )?;

            let beta = self.temp.betas[j].clone().ok_or_else(|| missing("beta"))?;
            let nu = self.temp.nus[j].clone().ok_or_else(|| missing("nu"))?;
            delta_i = delta_i + alpha + beta;
            sigma_i = sigma_i + mu + nu;
        }

        self.temp.delta_i = Some(delta_i.clone());
        self.temp.sigma_i = Some(sigma_i);

        let msg = SignRound3Message { delta: delta_i };
        self.temp.r3[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "sign round 3: MtA conversions done");
        self.base.broadcast(SignMessage::R3(msg))
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R3(body) = msg.payload {
                store_slot(&mut self.temp.r3, j, &body);
            }
        }
    }
}

impl Round4 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(4)?;
        let i = self.base.index as usize;
        let decommit = self.temp.own_decommit.clone().ok_or_else(|| missing("decommitment"))?;

        let msg = SignRound4Message { decommit };
        self.temp.r4[i] = Some(msg.clone());
        self.base.broadcast(SignMessage::R4(msg))
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R4(body) = msg.payload {
                store_slot(&mut self.temp.r4, j, &body);
            }
        }
    }
}

impl Round5 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(5)?;
        let i = self.base.index as usize;
        let q = Scalar::<Secp256k1>::group_order();

        let gamma_i = self.temp.gamma_i.clone().ok_or_else(|| missing("gamma_i"))?;
        let mut big_gamma = Point::generator() * &gamma_i;
        let mut delta = self.temp.delta_i.clone().ok_or_else(|| missing("delta_i"))?;

        for j in 0..self.base.dnode_count {
            if j == i {
                continue;
            }
            let uid_j = &self.ctx.sign_ids[j];
            let r1 = self.temp.r1[j].as_ref().ok_or_else(|| missing("round 1 message"))?;
            let r4 = self.temp.r4[j].as_ref().ok_or_else(|| missing("decommitment"))?;

            let opened = commit::verify(&r1.commitment, &r4.decommit).ok_or_else(|| {
                abort(4, AbortReason::CommitMismatch, uid_j)
            })?;
            let gamma_point = Point::from_bytes(&opened).map_err(|_| {
                abort(4, AbortReason::CommitMismatch, uid_j)
            })?;

            // The gamma the peer used inside MtA must be the gamma it
            // decommitted to.
            let r2 = self.temp.r2[j].as_ref().ok_or_else(|| missing("round 2 message"))?;
            if r2.mb_gamma.b_proof.pk != gamma_point {
                return Err(fault(FaultKind::BadShare, uid_j));
            }

            big_gamma = big_gamma + &gamma_point;
            let r3 = self.temp.r3[j].as_ref().ok_or_else(|| missing("delta share"))?;
            delta = delta + &r3.delta;
        }

        let delta_inv = delta.invert().ok_or_else(|| {
            MpcError::ProtocolAborted {
                round: 5,
                reason: AbortReason::AggregatePkDisagreement,
                offender: None,
            }
        })?;
        let big_r = big_gamma * delta_inv;
        let r_x = big_r.x_coord().ok_or_else(|| missing("R.x"))?;
        let r = Scalar::from_bigint(&r_x.mod_floor(q));

        let k_i = self.temp.k_i.clone().ok_or_else(|| missing("k_i"))?;
        let r_bar = &big_r * &k_i;
        let proof = AltBaseDlogProof::prove(&big_r, &k_i);

        self.temp.big_r = Some(big_r);
        self.temp.r = Some(r);

        let msg = SignRound5Message { r_bar, proof };
        self.temp.r5[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "sign round 5: nonce point fixed");
        self.base.broadcast(SignMessage::R5(msg))
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R5(body) = msg.payload {
                store_slot(&mut self.temp.r5, j, &body);
            }
        }
    }
}

impl Round6 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(6)?;
        let i = self.base.index as usize;
        let big_r = self.temp.big_r.clone().ok_or_else(|| missing("R"))?;

        let mut r_bar_sum = Point::<Secp256k1>::zero();
        for j in 0..self.base.dnode_count {
            let uid_j = &self.ctx.sign_ids[j];
            let r5 = self.temp.r5[j].as_ref().ok_or_else(|| missing("round 5 message"))?;
            if j != i && !r5.proof.verify(&big_r, &r5.r_bar) {
                return Err(abort(5, AbortReason::SchnorrProofBad, uid_j));
            }
            r_bar_sum = r_bar_sum + &r5.r_bar;
        }

        // Σ k_j * R must collapse to the generator; anything else means a
        // party used a different k than in its MtA conversions.
        if r_bar_sum != Point::generator().to_point() {
            return Err(MpcError::ProtocolAborted {
                round: 5,
                reason: AbortReason::AggregatePkDisagreement,
                offender: None,
            });
        }

        let sigma_i = self.temp.sigma_i.clone().ok_or_else(|| missing("sigma_i"))?;
        let s_point = &big_r * &sigma_i;
        let proof = AltBaseDlogProof::prove(&big_r, &sigma_i);

        let msg = SignRound6Message { s_point, proof };
        self.temp.r6[i] = Some(msg.clone());
        self.base.broadcast(SignMessage::R6(msg))
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R6(body) = msg.payload {
                store_slot(&mut self.temp.r6, j, &body);
            }
        }
    }

    fn verify_s_points(
        base: &SgBase,
        ctx: &SignContext,
        temp: &SignTemp
    ) -> MpcResult<()> {
        let i = base.index as usize;
        let big_r = temp.big_r.clone().ok_or_else(|| missing("R"))?;
        let mut s_sum = Point::<Secp256k1>::zero();
        for j in 0..base.dnode_count {
            let uid_j = &ctx.sign_ids[j];
            let r6 = temp.r6[j].as_ref().ok_or_else(|| missing("round 6 message"))?;
            if j != i && !r6.proof.verify(&big_r, &r6.s_point) {
                return Err(abort(6, AbortReason::SchnorrProofBad, uid_j));
            }
            s_sum = s_sum + &r6.s_point;
        }
        if s_sum != ctx.save.pk {
            return Err(MpcError::ProtocolAborted {
                round: 6,
                reason: AbortReason::AggregatePkDisagreement,
                offender: None,
            });
        }
        Ok(())
    }
}

impl Round7 {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(7)?;
        let i = self.base.index as usize;

        if !self.temp.finalize {
            Round6::verify_s_points(&self.base, &self.ctx, &self.temp)?;
        }

        let q = Scalar::<Secp256k1>::group_order();
        let m = self.ctx.msg_hash.as_ref().ok_or_else(|| missing("message hash"))?;
        let m_scalar = Scalar::<Secp256k1>::from_bigint(&m.mod_floor(q));

        let k_i = self.temp.k_i.clone().ok_or_else(|| missing("k_i"))?;
        let sigma_i = self.temp.sigma_i.clone().ok_or_else(|| missing("sigma_i"))?;
        let r = self.temp.r.clone().ok_or_else(|| missing("r"))?;

        let s_share = &m_scalar * &k_i + &r * &sigma_i;

        let msg = SignRound7Message { s_share };
        self.temp.r7[i] = Some(msg.clone());
        info!(session = %self.base.session_id, "sign round 7: publishing signature share");
        self.base.broadcast(SignMessage::R7(msg))
    }

    fn store(&mut self, msg: Incoming<SignMessage>) {
        if let Some(j) = self.base.sender_index(&self.ctx.sign_ids, &msg) {
            if let SignMessage::R7(body) = msg.payload {
                store_slot(&mut self.temp.r7, j, &body);
            }
        }
    }
}

impl RoundEnd {
    fn start(&mut self) -> MpcResult<()> {
        self.base.begin(8)?;
        match self.ctx.msg_hash {
            Some(_) => self.finish_signature(),
            None => self.finish_presign(),
        }
    }

    fn finish_presign(&mut self) -> MpcResult<()> {
        Round6::verify_s_points(&self.base, &self.ctx, &self.temp)?;
        let presign = PreSignData {
            k_i: self.temp.k_i.clone().ok_or_else(|| missing("k_i"))?,
            sigma_i: self.temp.sigma_i.clone().ok_or_else(|| missing("sigma_i"))?,
            r: self.temp.r.clone().ok_or_else(|| missing("r"))?,
            big_r: self.temp.big_r.clone().ok_or_else(|| missing("R"))?,
            sign_ids: self.ctx.sign_ids.clone(),
            own_index: self.base.index as usize,
        };
        info!(session = %self.base.session_id, "presign tuple ready");
        self.base.finish(SignOutput::PreSign(presign))
    }

    fn finish_signature(&mut self) -> MpcResult<()> {
        let q = Scalar::<Secp256k1>::group_order();
        let m = self.ctx.msg_hash.as_ref().ok_or_else(|| missing("message hash"))?;

        let mut s = Scalar::<Secp256k1>::zero();
        for j in 0..self.base.dnode_count {
            let r7 = self.temp.r7[j].as_ref().ok_or_else(|| missing("signature share"))?;
            s = s + &r7.s_share;
        }

        let r = self.temp.r.clone().ok_or_else(|| missing("r"))?;
        let big_r = self.temp.big_r.clone().ok_or_else(|| missing("R"))?;

        let y_parity = big_r
            .y_coord()
            .ok_or_else(|| missing("R.y"))?
            .test_bit(0);
        let x_overflow = big_r.x_coord().ok_or_else(|| missing("R.x"))? >= *q;

        let mut recid: u8 = u8::from(y_parity) | (u8::from(x_overflow) << 1);

        // Normalize to the low half of the order; verifiers reject high-s.
        let s_bn = s.to_bigint();
        let half_q = q / &BigInt::from(2);
        let s = if s_bn > half_q {
            recid ^= 1;
            Scalar::from_bigint(&(q - &s_bn))
        } else {
            s
        };

        let sig = SignatureRecid { r, s, recid };
        self.check_sig(&sig, m)?;

        info!(session = %self.base.session_id, "signature assembled and verified");
        self.base.finish(SignOutput::Signature(sig))
    }

    /// Recover the public key from the finished signature and compare it to
    /// the stored one; a mismatch means some share was bad.
    fn check_sig(&self, sig: &SignatureRecid, m: &BigInt) -> MpcResult<()> {
        use secp256k1::recovery::{ RecoverableSignature, RecoveryId };
        use secp256k1::{ Message, Secp256k1 };

        let failed = || MpcError::ProtocolAborted {
            round: 7,
            reason: AbortReason::AggregatePkDisagreement,
            offender: None,
        };

        let raw_msg = m.to_bytes();
        if raw_msg.len() > 32 {
            return Err(MpcError::BadInput("message hash longer than 32 bytes".into()));
        }
        let mut msg32 = [0u8; 32];
        msg32[32 - raw_msg.len()..].copy_from_slice(&raw_msg);
        let message = Message::from_slice(&msg32).map_err(|_| failed())?;

        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&scalar_to_32_bytes(&sig.r));
        compact[32..].copy_from_slice(&scalar_to_32_bytes(&sig.s));

        let recovery_id = RecoveryId::from_i32(i32::from(sig.recid)).map_err(|_| failed())?;
        let rec_sig = RecoverableSignature::from_compact(&compact, recovery_id)
            .map_err(|_| failed())?;
        let recovered = Secp256k1::new().recover(&message, &rec_sig).map_err(|_| failed())?;

        let mut expected = self.ctx.save.pk.to_bytes(false).to_vec();
        if expected.len() == 64 {
            expected.insert(0, 4u8);
        }
        if recovered.serialize_uncompressed().to_vec() != expected {
            return Err(failed());
        }
        Ok(())
    }
}

impl MpcRound for EcdsaSignRound {
    type Msg = SignMessage;
    type Output = SignOutput;

    fn number(&self) -> u32 {
        match self {
            EcdsaSignRound::R1(_) => 1,
            EcdsaSignRound::R2(_) => 2,
            EcdsaSignRound::R3(_) => 3,
            EcdsaSignRound::R4(_) => 4,
            EcdsaSignRound::R5(_) => 5,
            EcdsaSignRound::R6(_) => 6,
            EcdsaSignRound::R7(_) => 7,
            EcdsaSignRound::End(_) => 8,
        }
    }

    fn start(&mut self) -> MpcResult<()> {
        match self {
            EcdsaSignRound::R1(r) => r.start(),
            EcdsaSignRound::R2(r) => r.start(),
            EcdsaSignRound::R3(r) => r.start(),
            EcdsaSignRound::R4(r) => r.start(),
            EcdsaSignRound::R5(r) => r.start(),
            EcdsaSignRound::R6(r) => r.start(),
            EcdsaSignRound::R7(r) => r.start(),
            EcdsaSignRound::End(r) => r.start(),
        }
    }

    fn can_accept(&self, msg: &Incoming<SignMessage>) -> bool {
        match (self, &msg.payload) {
            (EcdsaSignRound::R1(_), SignMessage::R1(_)) => msg.is_broadcast,
            (EcdsaSignRound::R2(_), SignMessage::R2(_)) => !msg.is_broadcast,
            (EcdsaSignRound::R3(_), SignMessage::R3(_)) => msg.is_broadcast,
            (EcdsaSignRound::R4(_), SignMessage::R4(_)) => msg.is_broadcast,
            (EcdsaSignRound::R5(_), SignMessage::R5(_)) => msg.is_broadcast,
            (EcdsaSignRound::R6(_), SignMessage::R6(_)) => msg.is_broadcast,
            (EcdsaSignRound::R7(_), SignMessage::R7(_)) => msg.is_broadcast,
            _ => false,
        }
    }

    fn store_message(&mut self, msg: Incoming<SignMessage>) -> MpcResult<()> {
        match self {
            EcdsaSignRound::R1(r) => r.store(msg),
            EcdsaSignRound::R2(r) => r.store(msg),
            EcdsaSignRound::R3(r) => r.store(msg),
            EcdsaSignRound::R4(r) => r.store(msg),
            EcdsaSignRound::R5(r) => r.store(msg),
            EcdsaSignRound::R6(r) => r.store(msg),
            EcdsaSignRound::R7(r) => r.store(msg),
            EcdsaSignRound::End(_) => {}
        }
        Ok(())
    }

    fn update(&mut self) -> MpcResult<bool> {
        Ok(match self {
            EcdsaSignRound::R1(r) => slots_ok(&mut r.base, &r.temp.r1),
            EcdsaSignRound::R2(r) => r.update(),
            EcdsaSignRound::R3(r) => slots_ok(&mut r.base, &r.temp.r3),
            EcdsaSignRound::R4(r) => slots_ok(&mut r.base, &r.temp.r4),
            EcdsaSignRound::R5(r) => slots_ok(&mut r.base, &r.temp.r5),
            EcdsaSignRound::R6(r) => slots_ok(&mut r.base, &r.temp.r6),
            EcdsaSignRound::R7(r) => slots_ok(&mut r.base, &r.temp.r7),
            EcdsaSignRound::End(_) => false,
        })
    }

    fn next_round(self) -> Option<Self> {
        match self {
            EcdsaSignRound::R1(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EcdsaSignRound::R2(Round2 { base: r.base.advance(2, n), ctx: r.ctx, temp: r.temp }))
            }
            EcdsaSignRound::R2(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EcdsaSignRound::R3(Round3 { base: r.base.advance(3, n), ctx: r.ctx, temp: r.temp }))
            }
            EcdsaSignRound::R3(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EcdsaSignRound::R4(Round4 { base: r.base.advance(4, n), ctx: r.ctx, temp: r.temp }))
            }
            EcdsaSignRound::R4(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EcdsaSignRound::R5(Round5 { base: r.base.advance(5, n), ctx: r.ctx, temp: r.temp }))
            }
            EcdsaSignRound::R5(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EcdsaSignRound::R6(Round6 { base: r.base.advance(6, n), ctx: r.ctx, temp: r.temp }))
            }
            EcdsaSignRound::R6(r) => {
                let n = r.ctx.sign_ids.len();
                if r.ctx.msg_hash.is_some() {
                    Some(EcdsaSignRound::R7(Round7 { base: r.base.advance(7, n), ctx: r.ctx, temp: r.temp }))
                } else {
                    Some(EcdsaSignRound::End(RoundEnd { base: r.base.advance(8, n), ctx: r.ctx, temp: r.temp }))
                }
            }
            EcdsaSignRound::R7(r) => {
                let n = r.ctx.sign_ids.len();
                Some(EcdsaSignRound::End(RoundEnd { base: r.base.advance(8, n), ctx: r.ctx, temp: r.temp }))
            }
            EcdsaSignRound::End(_) => None,
        }
    }

    fn waiting_for(&self) -> Vec<String> {
        let (base, ids) = match self {
            EcdsaSignRound::R1(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::R2(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::R3(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::R4(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::R5(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::R6(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::R7(r) => (&r.base, &r.ctx.sign_ids),
            EcdsaSignRound::End(r) => (&r.base, &r.ctx.sign_ids),
        };
        base.waiting_for()
            .into_iter()
            .filter_map(|j| ids.get(j).map(|uid| uid.to_str_radix(16)))
            .collect()
    }
}
