use crate::crypto::paillier::sample_zn_star;
use crate::crypto::primes::SafePrimePool;
use crate::serdes::{ dec, dec_vec };
use curv::arithmetic::{ Converter, Integer, Modulo, Samplable };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha3::{ Digest, Keccak256 };

const ITERATIONS: usize = 128;

/// Auxiliary RSA modulus with two generators of `QR_Ñ`, the setup the MtA
/// range proofs commit against. `h1` is a square by construction and
/// `h2 = h1^α`; neither exponent ever leaves the generating party.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NtildeH1H2 {
    #[serde(with = "dec")]
    pub ntilde: BigInt,
    #[serde(with = "dec")]
    pub h1: BigInt,
    #[serde(with = "dec")]
    pub h2: BigInt,
}

/// Iterated Schnorr proof that `target = base^x mod Ñ` for a known `x`,
/// without revealing it. One commitment/response pair per challenge bit.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct DlnProof {
    #[serde(with = "dec_vec")]
    pub alpha: Vec<BigInt>,
    #[serde(with = "dec_vec")]
    pub t: Vec<BigInt>,
}

/// The Ntilde triple together with both direction proofs, as broadcast
/// during keygen round 1.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct NtildeWithProofs {
    pub ntilde: NtildeH1H2,
    pub h1_to_h2: DlnProof,
    pub h2_to_h1: DlnProof,
}

/// Build a fresh triple from two pool safe primes. The hidden group order
/// `q1*q2` never leaves this function except inside the proofs' responses.
pub fn generate_ntilde(bits: usize, pool: &SafePrimePool) -> NtildeWithProofs {
    loop {
        let (sp1, sp2) = pool.take_pair(bits / 2);
        let ntilde = &sp1.p * &sp2.p;
        let hidden_order = &sp1.q * &sp2.q;

        let f = sample_zn_star(&ntilde);
        let alpha = BigInt::sample_below(&hidden_order);
        let beta = match BigInt::mod_inv(&alpha, &hidden_order) {
            Some(beta) => beta,
            None => continue,
        };

        let h1 = BigInt::mod_pow(&f, &BigInt::from(2), &ntilde);
        let h2 = BigInt::mod_pow(&h1, &alpha, &ntilde);

        let triple = NtildeH1H2 { ntilde: ntilde.clone(), h1: h1.clone(), h2: h2.clone() };
        let h1_to_h2 = DlnProof::prove(&h1, &h2, &alpha, &hidden_order, &ntilde);
        let h2_to_h1 = DlnProof::prove(&h2, &h1, &beta, &hidden_order, &ntilde);

        return NtildeWithProofs { ntilde: triple, h1_to_h2, h2_to_h1 };
    }
}

impl NtildeWithProofs {
    pub fn verify(&self) -> bool {
        let t = &self.ntilde;
        if t.h1 == t.h2 || t.h1 <= BigInt::from(1) || t.h2 <= BigInt::from(1) {
            return false;
        }
        self.h1_to_h2.verify(&t.h1, &t.h2, &t.ntilde) && self.h2_to_h1.verify(&t.h2, &t.h1, &t.ntilde)
    }
}

impl DlnProof {
    pub fn prove(
        base: &BigInt,
        target: &BigInt,
        x: &BigInt,
        hidden_order: &BigInt,
        ntilde: &BigInt
    ) -> DlnProof {
        let nonces: Vec<BigInt> = (0..ITERATIONS)
            .map(|_| BigInt::sample_below(hidden_order))
            .collect();
        let alpha: Vec<BigInt> = nonces
            .iter()
            .map(|a| BigInt::mod_pow(base, a, ntilde))
            .collect();

        let challenge_bits = challenge(base, target, ntilde, &alpha);

        let t = nonces
            .iter()
            .zip(&challenge_bits)
            .map(|(a, bit)| {
                if *bit {
                    BigInt::mod_add(a, x, hidden_order)
                } else {
                    a.clone()
                }
            })
            .collect();

        DlnProof { alpha, t }
    }

    pub fn verify(&self, base: &BigInt, target: &BigInt, ntilde: &BigInt) -> bool {
        if self.alpha.len() != ITERATIONS || self.t.len() != ITERATIONS {
            return false;
        }
        let challenge_bits = challenge(base, target, ntilde, &self.alpha);
        for ((a, z), bit) in self.alpha.iter().zip(&self.t).zip(&challenge_bits) {
            let lhs = BigInt::mod_pow(base, z, ntilde);
            let rhs = if *bit {
                BigInt::mod_mul(a, target, ntilde)
            } else {
                a.mod_floor(ntilde)
            };
            if lhs != rhs {
                return false;
            }
        }
        true
    }
}

fn challenge(base: &BigInt, target: &BigInt, ntilde: &BigInt, alpha: &[BigInt]) -> Vec<bool> {
    let mut hasher = Keccak256::new()
        .chain(base.to_bytes())
        .chain(target.to_bytes())
        .chain(ntilde.to_bytes());
    for a in alpha {
        hasher = hasher.chain(a.to_bytes());
    }
    let digest = hasher.finalize();

    (0..ITERATIONS)
        .map(|i| (digest[(i / 8) % digest.len()] >> (i % 8)) & 1 == 1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_triple() -> &'static NtildeWithProofs {
        static TRIPLE: OnceLock<NtildeWithProofs> = OnceLock::new();
        TRIPLE.get_or_init(|| {
            let pool = SafePrimePool::new(2, 4);
            generate_ntilde(256, &pool)
        })
    }

    #[test]
    fn generated_triple_verifies() {
        assert!(test_triple().verify());
    }

    #[test]
    fn unrelated_generators_fail() {
        let mut forged = test_triple().clone();
        forged.ntilde.h2 = BigInt::mod_mul(
            &forged.ntilde.h2,
            &forged.ntilde.h1,
            &forged.ntilde.ntilde
        );
        assert!(!forged.verify());
    }

    #[test]
    fn equal_generators_are_rejected() {
        let mut forged = test_triple().clone();
        forged.ntilde.h2 = forged.ntilde.h1.clone();
        assert!(!forged.verify());
    }
}
