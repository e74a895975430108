pub mod connpool;
mod stream;

pub use stream::{serve_server_connection, Http2ClientStream, Http2ClientStreamConnection};
