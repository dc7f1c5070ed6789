use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    //socket level failure (bind/send/recv)
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("{peer}: {action} failed: {reason}")]
    ControlFailed {
        peer: SocketAddr,
        action: &'static str,
        reason: String,
    },

    #[error("reply has no <{0}> field")]
    ProtocolParse(&'static str),

    #[error("invalid time value: {0:?}")]
    InvalidTimeValue(String),

    #[error("invalid weekday expression: {0:?}")]
    InvalidWeekdayExpr(String),

    #[error("rescan interval {0}s is below the minimum of {1}s")]
    RescanTooShort(u32, u32),

    #[error("config: {0}")]
    Config(String),

    #[error("sun times unavailable: {0}")]
    SunUnavailable(String),
}
