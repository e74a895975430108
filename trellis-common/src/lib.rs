pub mod config;
pub mod error;
pub mod headers;
pub mod logs;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
pub type TrellisFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;
pub type TrellisResult<T> = std::result::Result<T, error::TrellisError>;
