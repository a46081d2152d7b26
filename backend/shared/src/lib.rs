pub mod accept;
pub mod key_info;
