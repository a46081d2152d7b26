pub mod kv;
pub mod records;

pub use kv::{ KvStore, MemoryStore };
pub use records::{ delete_record, iterate_table, load_record, request_key, store_record, Table };
