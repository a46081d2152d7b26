use crate::crypto::ntilde::NtildeH1H2;
use crate::crypto::paillier::{ sample_zn_star, PrivateKey, PublicKey };
use crate::error::{ FaultKind, MpcError };
use crate::serdes::dec;
use curv::arithmetic::{ BasicOps, Converter, Integer, Modulo, Samplable };
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha2::Sha256;
use sha3::{ Digest, Keccak256 };

fn curve_order() -> BigInt {
    Scalar::<Secp256k1>::group_order().clone()
}

/// The initiator's side of an MtA conversion: a Paillier encryption of `k_i`
/// plus one range proof per receiver, each against that receiver's Ntilde
/// triple.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct MessageA {
    #[serde(with = "dec")]
    pub c: BigInt,
    pub range_proofs: Vec<RangeProofAlice>,
}

impl MessageA {
    /// Encrypt `m` under the caller's own Paillier key and prove `m < q^3`
    /// toward every receiver. Returns the message and the encryption
    /// randomness (needed nowhere else but kept for auditability).
    pub fn new(
        m: &Scalar<Secp256k1>,
        own_ek: &PublicKey,
        receivers: &[NtildeH1H2]
    ) -> Result<(MessageA, BigInt), MpcError> {
        let m_bn = m.to_bigint();
        let (c, r) = own_ek.encrypt(&m_bn).map_err(|_| {
            MpcError::InternalInvariantViolated("scalar does not fit the paillier modulus".into())
        })?;

        let range_proofs = receivers
            .iter()
            .map(|ntilde| RangeProofAlice::prove(&m_bn, &r, &c, own_ek, ntilde))
            .collect();

        Ok((MessageA { c, range_proofs }, r))
    }

    /// Receiver-side check of the proof addressed to `receiver_index`.
    pub fn verify(
        &self,
        sender_ek: &PublicKey,
        own_ntilde: &NtildeH1H2,
        receiver_index: usize
    ) -> bool {
        match self.range_proofs.get(receiver_index) {
            Some(proof) => proof.verify(&self.c, sender_ek, own_ntilde),
            None => false,
        }
    }
}

/// Statistical range proof that the plaintext behind a Paillier ciphertext is
/// below `q^3`, committed over the verifier's `(Ñ, h1, h2)`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RangeProofAlice {
    #[serde(with = "dec")]
    pub z: BigInt,
    #[serde(with = "dec")]
    pub u: BigInt,
    #[serde(with = "dec")]
    pub w: BigInt,
    #[serde(with = "dec")]
    pub s: BigInt,
    #[serde(with = "dec")]
    pub s1: BigInt,
    #[serde(with = "dec")]
    pub s2: BigInt,
}

impl RangeProofAlice {
    pub fn prove(
        m: &BigInt,
        r: &BigInt,
        c: &BigInt,
        ek: &PublicKey,
        ntilde: &NtildeH1H2
    ) -> RangeProofAlice {
        let q = curve_order();
        let q3 = q.pow(3);
        let q_ntilde = &q * &ntilde.ntilde;
        let q3_ntilde = &q3 * &ntilde.ntilde;

        let alpha = BigInt::sample_below(&q3);
        let beta = sample_zn_star(&ek.n);
        let gamma = BigInt::sample_below(&q3_ntilde);
        let rho = BigInt::sample_below(&q_ntilde);

        let z = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, m, &ntilde.ntilde),
            &BigInt::mod_pow(&ntilde.h2, &rho, &ntilde.ntilde),
            &ntilde.ntilde
        );
        let u = BigInt::mod_mul(
            &BigInt::mod_pow(&ek.g, &alpha, &ek.nn),
            &BigInt::mod_pow(&beta, &ek.n, &ek.nn),
            &ek.nn
        );
        let w = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, &alpha, &ntilde.ntilde),
            &BigInt::mod_pow(&ntilde.h2, &gamma, &ntilde.ntilde),
            &ntilde.ntilde
        );

        let e = alice_challenge(ek, c, &z, &u, &w, &q);

        let s = BigInt::mod_mul(&BigInt::mod_pow(r, &e, &ek.n), &beta, &ek.n);
        let s1 = &(&e * m) + &alpha;
        let s2 = &(&e * &rho) + &gamma;

        RangeProofAlice { z, u, w, s, s1, s2 }
    }

    pub fn verify(&self, c: &BigInt, ek: &PublicKey, ntilde: &NtildeH1H2) -> bool {
        let q = curve_order();
        let q3 = q.pow(3);
        if self.s1 > q3 {
            return false;
        }

        let e = alice_challenge(ek, c, &self.z, &self.u, &self.w, &q);

        // G^s1 * s^N == u * c^e mod N^2
        let lhs_cipher = BigInt::mod_mul(
            &BigInt::mod_pow(&ek.g, &self.s1, &ek.nn),
            &BigInt::mod_pow(&self.s, &ek.n, &ek.nn),
            &ek.nn
        );
        let rhs_cipher = BigInt::mod_mul(&self.u, &BigInt::mod_pow(c, &e, &ek.nn), &ek.nn);
        if lhs_cipher != rhs_cipher {
            return false;
        }

        // h1^s1 * h2^s2 == z^e * w mod Ñ
        let lhs_commit = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, &self.s1, &ntilde.ntilde),
            &BigInt::mod_pow(&ntilde.h2, &self.s2, &ntilde.ntilde),
            &ntilde.ntilde
        );
        let rhs_commit = BigInt::mod_mul(
            &BigInt::mod_pow(&self.z, &e, &ntilde.ntilde),
            &self.w,
            &ntilde.ntilde
        );
        lhs_commit == rhs_commit
    }
}

fn alice_challenge(
    ek: &PublicKey,
    c: &BigInt,
    z: &BigInt,
    u: &BigInt,
    w: &BigInt,
    q: &BigInt
) -> BigInt {
    let digest = Keccak256::new()
        .chain(ek.n.to_bytes())
        .chain(ek.g.to_bytes())
        .chain(c.to_bytes())
        .chain(z.to_bytes())
        .chain(u.to_bytes())
        .chain(w.to_bytes())
        .finalize();
    BigInt::from_bytes(&digest).mod_floor(q)
}

/// The responder's side: `c_b = c_a^x * Enc(β')` plus the range proof for
/// `x` and a Schnorr proof binding `x * G`. The additive output pair is
/// `(α, β)` with `α = Dec(c_b) mod q`, `β = -β' mod q`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct MessageB {
    #[serde(with = "dec")]
    pub c: BigInt,
    pub b_proof: DLogProof<Secp256k1, Sha256>,
    pub range_proof: RangeProofBob,
}

/// What the responder keeps after building a `MessageB`.
pub struct MtaShare {
    pub beta: Scalar<Secp256k1>,
}

impl MessageB {
    pub fn new(
        x: &Scalar<Secp256k1>,
        alice_ek: &PublicKey,
        alice_ntilde: &NtildeH1H2,
        msg_a: &MessageA
    ) -> Result<(MessageB, MtaShare), MpcError> {
        let q = curve_order();
        let q3 = q.pow(3);

        let beta_prime = BigInt::sample_below(&q3);
        let (c_beta, r) = alice_ek.encrypt(&beta_prime).map_err(|_| {
            MpcError::InternalInvariantViolated("mask does not fit the paillier modulus".into())
        })?;

        let c_b = alice_ek.homo_add(&alice_ek.homo_mul(&msg_a.c, &x.to_bigint()), &c_beta);

        let range_proof = RangeProofBob::prove(
            &x.to_bigint(),
            &beta_prime,
            &r,
            &msg_a.c,
            &c_b,
            alice_ek,
            alice_ntilde
        );
        let b_proof = DLogProof::prove(x);

        let beta = Scalar::from_bigint(&BigInt::mod_sub(&BigInt::from(0), &beta_prime, &q));

        Ok((MessageB { c: c_b, b_proof, range_proof }, MtaShare { beta }))
    }

    /// Initiator-side verification and decryption. `expected_pk` pins the
    /// responder's secret to a public point when one is computable (the `w`
    /// conversion); the `γ` conversion defers that check to the decommit
    /// round via the carried `b_proof`.
    pub fn verify_and_decrypt(
        &self,
        own_dk: &PrivateKey,
        own_ntilde: &NtildeH1H2,
        c_a: &BigInt,
        expected_pk: Option<&Point<Secp256k1>>,
        sender_uid: &BigInt
    ) -> Result<Scalar<Secp256k1>, MpcError> {
        let fault = |kind| MpcError::PeerFaulted {
            uid: sender_uid.to_str_radix(16),
            kind,
        };

        if DLogProof::verify(&self.b_proof).is_err() {
            return Err(fault(FaultKind::BadShare));
        }
        if let Some(expected) = expected_pk {
            if &self.b_proof.pk != expected {
                return Err(fault(FaultKind::BadShare));
            }
        }
        if !self.range_proof.verify(c_a, &self.c, &own_dk.pk, own_ntilde) {
            return Err(fault(FaultKind::RangeProofBad));
        }

        let alpha = own_dk.decrypt(&self.c).map_err(|_| fault(FaultKind::RangeProofBad))?;
        Ok(Scalar::from_bigint(&alpha.mod_floor(&curve_order())))
    }
}

/// Range proof for the responder's secret in an MtA conversion
/// (`c2 = c1^x * Enc(y)` with `x < q^3`), committed over the verifier's
/// Ntilde triple.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RangeProofBob {
    #[serde(with = "dec")]
    pub z: BigInt,
    #[serde(with = "dec")]
    pub z_prime: BigInt,
    #[serde(with = "dec")]
    pub t: BigInt,
    #[serde(with = "dec")]
    pub v: BigInt,
    #[serde(with = "dec")]
    pub w: BigInt,
    #[serde(with = "dec")]
    pub s: BigInt,
    #[serde(with = "dec")]
    pub s1: BigInt,
    #[serde(with = "dec")]
    pub s2: BigInt,
    #[serde(with = "dec")]
    pub t1: BigInt,
    #[serde(with = "dec")]
    pub t2: BigInt,
}

impl RangeProofBob {
    #[allow(clippy::too_many_arguments)]
    pub fn prove(
        x: &BigInt,
        y: &BigInt,
        r: &BigInt,
        c1: &BigInt,
        c2: &BigInt,
        ek: &PublicKey,
        ntilde: &NtildeH1H2
    ) -> RangeProofBob {
        let q = curve_order();
        let q3 = q.pow(3);
        let q5 = q.pow(5);
        let q_ntilde = &q * &ntilde.ntilde;
        let q3_ntilde = &q3 * &ntilde.ntilde;
        let q5_ntilde = &q5 * &ntilde.ntilde;

        let alpha = BigInt::sample_below(&q3);
        let rho = BigInt::sample_below(&q_ntilde);
        let rho_prime = BigInt::sample_below(&q3_ntilde);
        let sigma = BigInt::sample_below(&q_ntilde);
        let gamma = BigInt::sample_below(&q5);
        let tau = BigInt::sample_below(&q5_ntilde);
        let beta = sample_zn_star(&ek.n);

        let nt = &ntilde.ntilde;
        let z = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, x, nt),
            &BigInt::mod_pow(&ntilde.h2, &rho, nt),
            nt
        );
        let z_prime = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, &alpha, nt),
            &BigInt::mod_pow(&ntilde.h2, &rho_prime, nt),
            nt
        );
        let t = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, y, nt),
            &BigInt::mod_pow(&ntilde.h2, &sigma, nt),
            nt
        );
        let w = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, &gamma, nt),
            &BigInt::mod_pow(&ntilde.h2, &tau, nt),
            nt
        );
        let v = BigInt::mod_mul(
            &BigInt::mod_mul(
                &BigInt::mod_pow(c1, &alpha, &ek.nn),
                &BigInt::mod_pow(&ek.g, &gamma, &ek.nn),
                &ek.nn
            ),
            &BigInt::mod_pow(&beta, &ek.n, &ek.nn),
            &ek.nn
        );

        let e = bob_challenge(ek, c1, c2, &z, &z_prime, &t, &v, &w, &q);

        let s = BigInt::mod_mul(&BigInt::mod_pow(r, &e, &ek.n), &beta, &ek.n);
        let s1 = &(&e * x) + &alpha;
        let s2 = &(&e * &rho) + &rho_prime;
        let t1 = &(&e * y) + &gamma;
        let t2 = &(&e * &sigma) + &tau;

        RangeProofBob { z, z_prime, t, v, w, s, s1, s2, t1, t2 }
    }

    pub fn verify(&self, c1: &BigInt, c2: &BigInt, ek: &PublicKey, ntilde: &NtildeH1H2) -> bool {
        let q = curve_order();
        let q3 = q.pow(3);
        if self.s1 > q3 {
            return false;
        }

        let e = bob_challenge(ek, c1, c2, &self.z, &self.z_prime, &self.t, &self.v, &self.w, &q);
        let nt = &ntilde.ntilde;

        // h1^s1 * h2^s2 == z^e * z' mod Ñ
        let lhs = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, &self.s1, nt),
            &BigInt::mod_pow(&ntilde.h2, &self.s2, nt),
            nt
        );
        let rhs = BigInt::mod_mul(&BigInt::mod_pow(&self.z, &e, nt), &self.z_prime, nt);
        if lhs != rhs {
            return false;
        }

        // h1^t1 * h2^t2 == t^e * w mod Ñ
        let lhs = BigInt::mod_mul(
            &BigInt::mod_pow(&ntilde.h1, &self.t1, nt),
            &BigInt::mod_pow(&ntilde.h2, &self.t2, nt),
            nt
        );
        let rhs = BigInt::mod_mul(&BigInt::mod_pow(&self.t, &e, nt), &self.w, nt);
        if lhs != rhs {
            return false;
        }

        // c1^s1 * G^t1 * s^N == c2^e * v mod N^2
        let lhs = BigInt::mod_mul(
            &BigInt::mod_mul(
                &BigInt::mod_pow(c1, &self.s1, &ek.nn),
                &BigInt::mod_pow(&ek.g, &self.t1, &ek.nn),
                &ek.nn
            ),
            &BigInt::mod_pow(&self.s, &ek.n, &ek.nn),
            &ek.nn
        );
        let rhs = BigInt::mod_mul(&BigInt::mod_pow(c2, &e, &ek.nn), &self.v, &ek.nn);
        lhs == rhs
    }
}

#[allow(clippy::too_many_arguments)]
fn bob_challenge(
    ek: &PublicKey,
    c1: &BigInt,
    c2: &BigInt,
    z: &BigInt,
    z_prime: &BigInt,
    t: &BigInt,
    v: &BigInt,
    w: &BigInt,
    q: &BigInt
) -> BigInt {
    let digest = Keccak256::new()
        .chain(ek.n.to_bytes())
        .chain(ek.g.to_bytes())
        .chain(c1.to_bytes())
        .chain(c2.to_bytes())
        .chain(z.to_bytes())
        .chain(z_prime.to_bytes())
        .chain(t.to_bytes())
        .chain(v.to_bytes())
        .chain(w.to_bytes())
        .finalize();
    BigInt::from_bytes(&digest).mod_floor(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ntilde::{ generate_ntilde, NtildeWithProofs };
    use crate::crypto::paillier::generate_key_pair;
    use crate::crypto::primes::SafePrimePool;
    use std::sync::OnceLock;

    struct Setup {
        ek: PublicKey,
        dk: PrivateKey,
        ntilde: NtildeWithProofs,
    }

    fn setup() -> &'static Setup {
        static SETUP: OnceLock<Setup> = OnceLock::new();
        SETUP.get_or_init(|| {
            let pool = SafePrimePool::new(2, 4);
            let (ek, dk) = generate_key_pair(1024, &pool);
            let ntilde = generate_ntilde(512, &pool);
            Setup { ek, dk, ntilde }
        })
    }

    #[test]
    fn mta_produces_additive_shares_of_the_product() {
        let s = setup();
        let k = Scalar::<Secp256k1>::random();
        let gamma = Scalar::<Secp256k1>::random();

        let (msg_a, _r) = MessageA::new(&k, &s.ek, &[s.ntilde.ntilde.clone()]).unwrap();
        assert!(msg_a.verify(&s.ek, &s.ntilde.ntilde, 0));

        let (msg_b, keep) = MessageB::new(&gamma, &s.ek, &s.ntilde.ntilde, &msg_a).unwrap();
        let alpha = msg_b
            .verify_and_decrypt(&s.dk, &s.ntilde.ntilde, &msg_a.c, None, &BigInt::from(7))
            .unwrap();

        assert_eq!(alpha + keep.beta, k * gamma);
    }

    #[test]
    fn bound_public_point_is_enforced() {
        let s = setup();
        let k = Scalar::<Secp256k1>::random();
        let w = Scalar::<Secp256k1>::random();
        let w_point = Point::generator() * &w;

        let (msg_a, _) = MessageA::new(&k, &s.ek, &[s.ntilde.ntilde.clone()]).unwrap();
        let (msg_b, _) = MessageB::new(&w, &s.ek, &s.ntilde.ntilde, &msg_a).unwrap();

        assert!(
            msg_b
                .verify_and_decrypt(
                    &s.dk,
                    &s.ntilde.ntilde,
                    &msg_a.c,
                    Some(&w_point),
                    &BigInt::from(7)
                )
                .is_ok()
        );

        let wrong = Point::generator() * Scalar::random();
        let err = msg_b
            .verify_and_decrypt(&s.dk, &s.ntilde.ntilde, &msg_a.c, Some(&wrong), &BigInt::from(7))
            .unwrap_err();
        assert!(matches!(err, MpcError::PeerFaulted { .. }));
    }

    #[test]
    fn out_of_range_ciphertext_fails_the_proof() {
        let s = setup();
        let k = Scalar::<Secp256k1>::random();
        let gamma = Scalar::<Secp256k1>::random();

        let (msg_a, _) = MessageA::new(&k, &s.ek, &[s.ntilde.ntilde.clone()]).unwrap();
        let (mut msg_b, _) = MessageB::new(&gamma, &s.ek, &s.ntilde.ntilde, &msg_a).unwrap();

        // Swap the ciphertext for an unrelated encryption; the proof no
        // longer matches the statement.
        let (forged, _) = s.ek.encrypt(&BigInt::from(42)).unwrap();
        msg_b.c = forged;

        let err = msg_b
            .verify_and_decrypt(&s.dk, &s.ntilde.ntilde, &msg_a.c, None, &BigInt::from(2))
            .unwrap_err();
        assert!(matches!(err, MpcError::PeerFaulted { kind: FaultKind::RangeProofBad, .. }));
    }

    #[test]
    fn alice_proof_rejects_oversized_plaintext() {
        let s = setup();
        let q = Scalar::<Secp256k1>::group_order().clone();
        let big = q.pow(3) + BigInt::from(5);
        let (c, r) = s.ek.encrypt(&big).unwrap();
        let proof = RangeProofAlice::prove(&big, &r, &c, &s.ek, &s.ntilde.ntilde);
        // s1 = e*m + alpha necessarily exceeds q^3.
        assert!(!proof.verify(&c, &s.ek, &s.ntilde.ntilde));
    }
}
