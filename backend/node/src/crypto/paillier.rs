use crate::crypto::primes::SafePrimePool;
use crate::serdes::dec;
use curv::arithmetic::{ Converter, Modulo, One, Samplable, Zero };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha3::{ Digest, Keccak256 };
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaillierError {
    #[error("message is too long")]
    MessageTooLong,
}

/// Paillier public key: `n = p*q`, `g = n + 1`, `nn = n^2`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PublicKey {
    pub length: usize,
    #[serde(with = "dec")]
    pub n: BigInt,
    #[serde(with = "dec")]
    pub g: BigInt,
    #[serde(with = "dec")]
    pub nn: BigInt,
}

/// Paillier private key: the public part plus `l = (p-1)(q-1)` and
/// `u = l^-1 mod n`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PrivateKey {
    pub pk: PublicKey,
    #[serde(with = "dec")]
    pub l: BigInt,
    #[serde(with = "dec")]
    pub u: BigInt,
}

/// Draw two safe primes from the pool and assemble a keypair of `length`
/// modulus bits. Blocks until the pool has supply.
pub fn generate_key_pair(length: usize, pool: &SafePrimePool) -> (PublicKey, PrivateKey) {
    loop {
        let (sp1, sp2) = pool.take_pair(length / 2);
        let p = sp1.p;
        let q = sp2.p;

        let n = &p * &q;
        let nn = &n * &n;
        let g = &n + BigInt::one();

        let p_minus_1 = &p - BigInt::one();
        let q_minus_1 = &q - BigInt::one();
        let l = &p_minus_1 * &q_minus_1;

        // gcd(l, n) = 1 must hold for decryption; a fresh draw fixes the
        // (vanishingly rare) failure.
        let u = match BigInt::mod_inv(&l, &n) {
            Some(u) => u,
            None => continue,
        };

        let pk = PublicKey { length, n, g, nn };
        let sk = PrivateKey { pk: pk.clone(), l, u };
        return (pk, sk);
    }
}

/// A uniform element of `Z_n*`.
pub fn sample_zn_star(n: &BigInt) -> BigInt {
    loop {
        let r = BigInt::sample_below(n);
        if r.is_zero() {
            continue;
        }
        if BigInt::mod_inv(&r, n).is_some() {
            return r;
        }
    }
}

impl PublicKey {
    /// `c = g^m * r^n mod n^2` for `m ∈ [0, n)`. Returns the ciphertext and
    /// the randomness used (the MtA proofs need it).
    pub fn encrypt(&self, m: &BigInt) -> Result<(BigInt, BigInt), PaillierError> {
        if m >= &self.n {
            return Err(PaillierError::MessageTooLong);
        }
        let r = sample_zn_star(&self.n);
        let gm = BigInt::mod_pow(&self.g, m, &self.nn);
        let rn = BigInt::mod_pow(&r, &self.n, &self.nn);
        let c = BigInt::mod_mul(&gm, &rn, &self.nn);
        Ok((c, r))
    }

    /// Homomorphic addition: `Dec(add(c1, c2)) = m1 + m2 mod n`.
    pub fn homo_add(&self, c1: &BigInt, c2: &BigInt) -> BigInt {
        BigInt::mod_mul(c1, c2, &self.nn)
    }

    /// Homomorphic scalar multiplication: `Dec(mul(c, k)) = m * k mod n`.
    pub fn homo_mul(&self, c: &BigInt, k: &BigInt) -> BigInt {
        BigInt::mod_pow(c, k, &self.nn)
    }
}

impl PrivateKey {
    pub fn decrypt(&self, c: &BigInt) -> Result<BigInt, PaillierError> {
        if c >= &self.pk.nn {
            return Err(PaillierError::MessageTooLong);
        }
        let cl = BigInt::mod_pow(c, &self.l, &self.pk.nn);
        let quotient = (&cl - BigInt::one()) / &self.pk.n;
        Ok(BigInt::mod_mul(&quotient, &self.u, &self.pk.n))
    }
}

/// Zero-knowledge proof of knowledge of `φ(n)` (equivalently, of the
/// factorization of `n`): `y = r + (n + φ(n)) * e` with a hash challenge over
/// `h1^r, h2^r`. Verification recomputes `h_i^(y - n*e) = h_i^(r + φ(n)*e)`,
/// which collapses to `h_i^r` exactly when the prover knew `φ(n)` (the order
/// of `Z_n*`).
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ZkFactProof {
    #[serde(with = "dec")]
    pub h1: BigInt,
    #[serde(with = "dec")]
    pub h2: BigInt,
    #[serde(with = "dec")]
    pub y: BigInt,
    #[serde(with = "dec")]
    pub e: BigInt,
    #[serde(with = "dec")]
    pub n: BigInt,
}

impl PrivateKey {
    pub fn zk_fact_prove(&self) -> ZkFactProof {
        let h1 = sample_zn_star(&self.pk.n);
        let h2 = sample_zn_star(&self.pk.n);
        let r = BigInt::sample_below(&self.pk.n);

        let h1r = BigInt::mod_pow(&h1, &r, &self.pk.n);
        let h2r = BigInt::mod_pow(&h2, &r, &self.pk.n);
        let e = fact_challenge(&h1r, &h2r);

        let n_plus_phi = &self.pk.n + &self.l;
        let y = &r + &n_plus_phi * &e;

        ZkFactProof { h1, h2, y, e, n: self.pk.n.clone() }
    }
}

impl PublicKey {
    pub fn zk_fact_verify(&self, proof: &ZkFactProof) -> bool {
        if proof.n != self.n {
            return false;
        }
        let ne = &self.n * &proof.e;
        // An honest y = r + (n + φ(n))*e leaves r + φ(n)*e here, never
        // negative; anything smaller is malformed.
        let exponent = &proof.y - &ne;
        if exponent < BigInt::zero() {
            return false;
        }
        let h1r = BigInt::mod_pow(&proof.h1, &exponent, &self.n);
        let h2r = BigInt::mod_pow(&proof.h2, &exponent, &self.n);
        fact_challenge(&h1r, &h2r) == proof.e
    }
}

fn fact_challenge(h1r: &BigInt, h2r: &BigInt) -> BigInt {
    let digest = Keccak256::new()
        .chain(h1r.to_bytes())
        .chain(h2r.to_bytes())
        .finalize();
    BigInt::from_bytes(&digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::primes::SafePrimePool;
    use curv::arithmetic::Integer;
    use std::sync::OnceLock;

    pub fn test_keypair() -> &'static (PublicKey, PrivateKey) {
        static KEYS: OnceLock<(PublicKey, PrivateKey)> = OnceLock::new();
        KEYS.get_or_init(|| {
            let pool = SafePrimePool::new(2, 4);
            generate_key_pair(256, &pool)
        })
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let (pk, sk) = test_keypair();
        for m in [BigInt::zero(), BigInt::one(), BigInt::from(123_456_789u64), &pk.n - BigInt::one()] {
            let (c, _r) = pk.encrypt(&m).unwrap();
            assert_eq!(sk.decrypt(&c).unwrap(), m);
        }
    }

    #[test]
    fn oversized_inputs_are_rejected() {
        let (pk, sk) = test_keypair();
        assert_eq!(pk.encrypt(&pk.n).unwrap_err(), PaillierError::MessageTooLong);
        assert_eq!(sk.decrypt(&pk.nn).unwrap_err(), PaillierError::MessageTooLong);
    }

    #[test]
    fn homomorphic_add_and_mul() {
        let (pk, sk) = test_keypair();
        let m1 = BigInt::from(1_000_000u64);
        let m2 = BigInt::from(2_345u64);

        let (c1, _) = pk.encrypt(&m1).unwrap();
        let (c2, _) = pk.encrypt(&m2).unwrap();

        let sum = sk.decrypt(&pk.homo_add(&c1, &c2)).unwrap();
        assert_eq!(sum, (&m1 + &m2).mod_floor(&pk.n));

        let k = BigInt::from(77u64);
        let scaled = sk.decrypt(&pk.homo_mul(&c1, &k)).unwrap();
        assert_eq!(scaled, (&m1 * &k).mod_floor(&pk.n));
    }

    #[test]
    fn factorization_proof_roundtrip() {
        let (pk, sk) = test_keypair();
        let proof = sk.zk_fact_prove();
        assert!(pk.zk_fact_verify(&proof));

        let mut bad = proof.clone();
        bad.y = &bad.y + BigInt::one();
        assert!(!pk.zk_fact_verify(&bad));
    }
}
