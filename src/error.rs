//! Error taxonomy for the proxy, per spec.md §7.
//!
//! Nothing escapes the process except a fatal startup failure; every other
//! variant here is caught at the connection boundary and translated into a
//! teardown (client close, target invalidate-and-close) rather than
//! propagated further.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("extract offset {offset} past body length {len}")]
    OffsetOutOfRange { offset: usize, len: usize },
    #[error("append to a finished cache entry")]
    AlreadyFinished,
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("descriptor already registered")]
    AlreadyRegistered,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("TLS port refused: {0}")]
    TlsRefused(u16),
    #[error("name resolution failed for {0}")]
    Resolve(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed status line")]
    BadStatusLine,
    #[error("malformed header line")]
    BadHeader,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
