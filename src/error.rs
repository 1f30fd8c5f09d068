use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    Parse(&'static str),

    #[error("host {0} is blocked")]
    Blocked(String),

    #[error("upstream {host}:{port} unreachable: {source}")]
    Upstream {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a response is passed through without being cached.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSkip {
    #[error("origin answered 404")]
    NotFound,
    #[error("no numeric Cache-Control max-age")]
    NoMaxAge,
    #[error("response forbids caching")]
    NoCache,
    #[error("presented Age already exceeds max-age")]
    AlreadyStale,
    #[error("unparseable Age header")]
    InvalidAge,
}

// Disconnects that are part of normal proxy traffic, not failures.
pub fn is_expected_error(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
