use curv::arithmetic::{ BitManipulation, Converter, Integer, Modulo, Samplable, Zero };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use std::collections::HashMap;
use std::sync::mpsc::{ sync_channel, Receiver };
use std::sync::{ Arc, Mutex, OnceLock };
use std::thread;
use tracing::debug;

const MILLER_RABIN_ROUNDS: usize = 20;
const SIEVE_BOUND: u32 = 10_000;

/// A safe prime `p = 2q + 1` together with its Sophie Germain half.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SafePrime {
    pub p: BigInt,
    pub q: BigInt,
}

fn small_primes() -> &'static Vec<u32> {
    static PRIMES: OnceLock<Vec<u32>> = OnceLock::new();
    PRIMES.get_or_init(|| {
        let mut primes: Vec<u32> = vec![2];
        let mut n = 3u32;
        while n < SIEVE_BOUND {
            if primes.iter().take_while(|p| *p * *p <= n).all(|p| n % p != 0) {
                primes.push(n);
            }
            n += 2;
        }
        primes
    })
}

/// Probabilistic primality test (Miller-Rabin) behind a short trial
/// division.
pub fn is_probable_prime(n: &BigInt, rounds: usize) -> bool {
    if n < &BigInt::from(2) {
        return false;
    }
    for p in small_primes().iter().take_while(|p| **p < 100) {
        let p = BigInt::from(*p);
        if n == &p {
            return true;
        }
        if n.mod_floor(&p).is_zero() {
            return false;
        }
    }

    let one = BigInt::from(1);
    let two = BigInt::from(2);
    let n_minus_1 = n - &one;
    let mut d = n_minus_1.clone();
    let mut s = 0u32;
    while !d.test_bit(0) {
        d = &d / &two;
        s += 1;
    }

    'witness: for _ in 0..rounds {
        let a = BigInt::sample_below(&(n - &BigInt::from(3))) + BigInt::from(2);
        let mut x = BigInt::mod_pow(&a, &d, n);
        if x == one || x == n_minus_1 {
            continue;
        }
        for _ in 0..s.saturating_sub(1) {
            x = BigInt::mod_pow(&x, &BigInt::from(2), n);
            if x == n_minus_1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Candidates scanned from one random base before drawing a fresh one.
const SIEVE_WINDOW: u64 = 1 << 20;

/// Search for a safe prime `p = 2q + 1` of exactly `bits` bits. The search
/// scans `q, q+2, q+4, ...` from a random base, tracking the residues of
/// both halves modulo every small prime so only candidates with no small
/// factor on either side reach Miller-Rabin.
pub fn generate_safe_prime(bits: usize) -> SafePrime {
    loop {
        let mut base = BigInt::strict_sample(bits - 1);
        base.set_bit(0, true);

        let primes = small_primes();
        let q_res: Vec<u64> = primes.iter().map(|r| small_rem(&base, *r)).collect();

        for k in 0..SIEVE_WINDOW {
            let survives = primes.iter().enumerate().all(|(idx, r)| {
                let r = u64::from(*r);
                let q_mod = (q_res[idx] + 2 * k) % r;
                // p = 2q + 1, so p mod r follows from q mod r.
                let p_mod = (2 * q_mod + 1) % r;
                q_mod != 0 && p_mod != 0
            });
            if !survives {
                continue;
            }

            let q = &base + BigInt::from(2 * k);
            if q.bit_length() != bits - 1 {
                break;
            }
            if !is_probable_prime(&q, MILLER_RABIN_ROUNDS) {
                continue;
            }
            let p = &q * &BigInt::from(2) + BigInt::from(1);
            if is_probable_prime(&p, MILLER_RABIN_ROUNDS) {
                return SafePrime { p, q };
            }
        }
    }
}

fn small_rem(n: &BigInt, r: u32) -> u64 {
    let rem = n.mod_floor(&BigInt::from(r));
    rem.to_bytes().iter().fold(0u64, |acc, b| acc * 256 + u64::from(*b))
}

struct Lane {
    rx: Arc<Mutex<Receiver<SafePrime>>>,
}

/// Lazy, shared producer-consumer pool of safe primes. Worker threads refill
/// a bounded channel per requested size; `take_pair` blocks until two primes
/// are available. Paillier and Ntilde keygen both draw from here, so the
/// expensive search is amortized across all sessions of an engine.
pub struct SafePrimePool {
    lanes: Mutex<HashMap<usize, Lane>>,
    workers: usize,
    capacity: usize,
}

impl SafePrimePool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        SafePrimePool {
            lanes: Mutex::new(HashMap::new()),
            workers: workers.max(1),
            capacity: capacity.max(2),
        }
    }

    /// Start producing primes of the given size before they are first needed.
    pub fn warm_up(&self, bits: usize) {
        self.lane(bits);
    }

    /// Two distinct safe primes of `bits` bits each. Blocks until supply is
    /// available.
    pub fn take_pair(&self, bits: usize) -> (SafePrime, SafePrime) {
        let rx = self.lane(bits);
        let rx = rx.lock().expect("prime lane poisoned");
        let first = rx.recv().expect("prime producer stopped");
        loop {
            let second = rx.recv().expect("prime producer stopped");
            if second.p != first.p {
                return (first, second);
            }
        }
    }

    fn lane(&self, bits: usize) -> Arc<Mutex<Receiver<SafePrime>>> {
        let mut lanes = self.lanes.lock().expect("prime pool poisoned");
        let lane = lanes.entry(bits).or_insert_with(|| {
            let (tx, rx) = sync_channel::<SafePrime>(self.capacity);
            for worker in 0..self.workers {
                let tx = tx.clone();
                thread::Builder::new()
                    .name(format!("safe-prime-{bits}-{worker}"))
                    .spawn(move || {
                        loop {
                            let prime = generate_safe_prime(bits);
                            debug!("safe prime of {} bits ready", bits);
                            if tx.send(prime).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("spawn prime worker");
            }
            Lane { rx: Arc::new(Mutex::new(rx)) }
        });
        lane.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miller_rabin_agrees_with_known_values() {
        for p in [2u32, 3, 5, 7, 65537, 7919] {
            assert!(is_probable_prime(&BigInt::from(p), 16), "{p} is prime");
        }
        for c in [1u32, 4, 100, 65535, 7917] {
            assert!(!is_probable_prime(&BigInt::from(c), 16), "{c} is composite");
        }
        // Carmichael number 561 = 3 * 11 * 17.
        assert!(!is_probable_prime(&BigInt::from(561u32), 16));
    }

    #[test]
    fn generated_safe_primes_have_prime_halves() {
        let sp = generate_safe_prime(64);
        assert_eq!(sp.p.bit_length(), 64);
        assert!(is_probable_prime(&sp.p, 16));
        assert!(is_probable_prime(&sp.q, 16));
        assert_eq!(sp.p, &sp.q * &BigInt::from(2) + BigInt::from(1));
    }

    #[test]
    fn pool_hands_out_distinct_primes() {
        let pool = SafePrimePool::new(2, 4);
        let (a, b) = pool.take_pair(64);
        assert_ne!(a.p, b.p);
    }
}
