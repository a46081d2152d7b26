pub mod dnode;
pub mod message;
pub mod round;
