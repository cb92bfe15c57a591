#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    ConfigError(#[from] crate::config::ConfigError),

    #[error(transparent)]
    DnsError(#[from] crate::net::dns::DnsError),

    #[error(transparent)]
    SocksError(#[from] crate::net::socks::SocksError),

    #[error(transparent)]
    ClientError(#[from] crate::http::ClientError),
}
