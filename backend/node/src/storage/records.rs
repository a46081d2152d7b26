use crate::storage::kv::KvStore;
use anyhow::{ Context, Result };
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha3::{ Digest, Keccak256 };
use std::io::{ Read, Write };
use strum_macros::Display;

/// Logical tables of the store, used as key prefixes.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Table {
    #[strum(serialize = "reqaddr_info")]
    ReqAddrInfo,
    #[strum(serialize = "sign_info")]
    SignInfo,
    #[strum(serialize = "reshare_info")]
    ReshareInfo,
    #[strum(serialize = "pubkey_data")]
    PubKeyData,
}

/// Content hash of the canonical request string, hex encoded. All record
/// writes are keyed by this, which makes retries idempotent.
pub fn request_key(canonical: &str) -> String {
    hex::encode(Keccak256::digest(canonical.as_bytes()))
}

fn table_key(table: Table, key: &str) -> String {
    format!("{table}/{key}")
}

/// Gzip-compressed JSON write of a terminal-state record.
pub fn store_record<T: Serialize>(
    store: &dyn KvStore,
    table: Table,
    key: &str,
    record: &T
) -> Result<()> {
    let json = serde_json::to_vec(record)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    store.put(&table_key(table, key), compressed)
}

pub fn load_record<T: DeserializeOwned>(
    store: &dyn KvStore,
    table: Table,
    key: &str
) -> Result<Option<T>> {
    let raw = match store.get(&table_key(table, key))? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let mut decoder = GzDecoder::new(raw.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).context("record is not valid gzip")?;
    Ok(Some(serde_json::from_slice(&json)?))
}

pub fn delete_record(store: &dyn KvStore, table: Table, key: &str) -> Result<()> {
    store.delete(&table_key(table, key))
}

/// All keys of one table, without the prefix.
pub fn iterate_table(store: &dyn KvStore, table: Table) -> Result<Vec<String>> {
    let prefix = format!("{table}/");
    Ok(
        store
            .iterate(&prefix)?
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryStore;
    use serde::{ Deserialize, Serialize };

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Record {
        status: String,
        count: u32,
    }

    #[test]
    fn request_keys_are_stable_hex() {
        let a = request_key("keygen:g1:t2");
        let b = request_key("keygen:g1:t2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, request_key("keygen:g1:t3"));
    }

    #[test]
    fn records_roundtrip_through_gzip_json() {
        let store = MemoryStore::new();
        let record = Record { status: "Success".into(), count: 3 };
        store_record(&store, Table::SignInfo, "abcd", &record).unwrap();

        let raw = store.get("sign_info/abcd").unwrap().unwrap();
        assert_ne!(raw, serde_json::to_vec(&record).unwrap(), "value must be compressed");

        let back: Record = load_record(&store, Table::SignInfo, "abcd").unwrap().unwrap();
        assert_eq!(back, record);

        assert_eq!(iterate_table(&store, Table::SignInfo).unwrap(), vec!["abcd".to_string()]);
        delete_record(&store, Table::SignInfo, "abcd").unwrap();
        assert!(load_record::<Record>(&store, Table::SignInfo, "abcd").unwrap().is_none());
    }
}
