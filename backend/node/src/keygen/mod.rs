pub mod ecdsa;
pub mod eddsa;
