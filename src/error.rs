use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("channel full")]
    ChannelFull,
    #[error("free list exhausted")]
    FreeListExhausted,
    #[error("read interrupted")]
    Interrupted,
    #[error("connection table full")]
    TableFull,
    #[error("unknown connection handle: {0}")]
    NotFound(u32),
    #[error("invalid config: {0}")]
    Config(&'static str),
    #[error("allocation failed: {0}")]
    Alloc(&'static str),
    #[error("copy failed: {0}")]
    Copy(&'static str),
}

impl Error {
    /// Negative errno-style status, as handed back across a C-like boundary.
    pub fn status(&self) -> i32 {
        let code = match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::BufferTooSmall { .. } => libc::ENOBUFS,
            Error::UnknownKind(_) => libc::EPROTO,
            Error::Truncated { .. } => libc::ENODATA,
            Error::Malformed(_) => libc::EBADMSG,
            Error::MessageTooLarge(_) => libc::EMSGSIZE,
            Error::ChannelFull => libc::EAGAIN,
            Error::FreeListExhausted => libc::ENOBUFS,
            Error::Interrupted => libc::EINTR,
            Error::TableFull => libc::ENOSPC,
            Error::NotFound(_) => libc::ENOENT,
            Error::Config(_) => libc::EINVAL,
            Error::Alloc(_) => libc::ENOMEM,
            Error::Copy(_) => libc::EFAULT,
        };
        -code
    }

    /// Capacity errors are expected under load; callers retry or drop.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::ChannelFull | Error::FreeListExhausted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
