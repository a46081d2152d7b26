use std::env;
use std::time::Duration;

/// Engine configuration. Every knob can be overridden from the environment
/// (`SMPC_*`), loaded once at startup; `.env` files are honored for local
/// runs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum idle time between inbound messages of a running session.
    pub wait_msg: Duration,
    /// Maximum time to assemble the participating set (round 0).
    pub wait_agree: Duration,
    /// Total attempt budget per request; 1 means no retry.
    pub try_times: u32,
    /// ECDSA presign cache size per key.
    pub presign_num: usize,
    /// Presign tuples reserved for derived-child signings.
    pub bip32_pre: usize,
    /// Paillier modulus size in bits.
    pub paillier_bits: usize,
    /// Auxiliary (Ntilde) modulus size in bits.
    pub ntilde_bits: usize,
    /// Safe-prime producer threads per prime size.
    pub prime_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            wait_msg: Duration::from_secs(120),
            wait_agree: Duration::from_secs(120),
            try_times: 1,
            presign_num: 10,
            bip32_pre: 4,
            paillier_bits: 2048,
            ntilde_bits: 2048,
            prime_workers: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        let defaults = Config::default();
        Config {
            wait_msg: env_secs("SMPC_WAIT_MSG").unwrap_or(defaults.wait_msg),
            wait_agree: env_secs("SMPC_WAIT_AGREE").unwrap_or(defaults.wait_agree),
            try_times: env_parse("SMPC_TRY_TIMES").unwrap_or(defaults.try_times),
            presign_num: env_parse("SMPC_PRESIGN_NUM").unwrap_or(defaults.presign_num),
            bip32_pre: env_parse("SMPC_BIP32_PRE").unwrap_or(defaults.bip32_pre),
            paillier_bits: env_parse("SMPC_PAILLIER_BITS").unwrap_or(defaults.paillier_bits),
            ntilde_bits: env_parse("SMPC_NTILDE_BITS").unwrap_or(defaults.ntilde_bits),
            prime_workers: env_parse("SMPC_PRIME_WORKERS").unwrap_or(defaults.prime_workers),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.wait_msg, Duration::from_secs(120));
        assert_eq!(cfg.wait_agree, Duration::from_secs(120));
        assert_eq!(cfg.try_times, 1);
        assert_eq!(cfg.presign_num, 10);
        assert_eq!(cfg.bip32_pre, 4);
    }
}
