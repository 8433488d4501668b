use thiserror::Error;

use crate::ChannelState;

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Error, Debug)]
pub enum IpcError {
    /// Send or receive attempted out of the strict request/reply order.
    #[error("{op} not allowed while channel is {state:?}")]
    OutOfTurn {
        op: &'static str,
        state: ChannelState,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Peer closed the connection.
    #[error("channel closed by peer")]
    Closed,

    /// Channel saw a timeout or I/O failure and must be reconnected.
    #[error("channel is broken and must be reconnected")]
    Broken,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout(_))
    }
}
