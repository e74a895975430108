pub mod connpool;
pub mod keepalive;
mod stream;

pub use stream::{BoltStream, BoltStreamConnection};
