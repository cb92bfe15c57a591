pub mod config;
pub mod error;
pub mod gate;
pub mod gzip;
pub mod http;
pub mod net;
pub mod serve;
pub mod wiki;

pub use error::Error;

/// The crate's `Result` type alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
