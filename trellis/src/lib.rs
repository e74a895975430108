pub mod buffer;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod server;
pub mod stream;
pub mod sync;
pub mod upstream;

pub use trellis_common;

pub type Error = trellis_common::Error;
pub type Result<T> = trellis_common::Result<T>;
pub type TrellisFuture<T> = trellis_common::TrellisFuture<T>;
