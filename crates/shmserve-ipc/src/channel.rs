//! Strictly alternating request/reply channels over Unix streams.
//!
//! A request side may only send when it is not waiting for a reply, and may
//! only receive after a send. The reply side is the mirror image. Both
//! states live in the channel object and every operation checks them before
//! touching the socket, so a call out of order is an error instead of a hang.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::frame::{read_frame, write_frame};
use crate::{Deadline, IpcError, Parts, Result};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingSend,
    AwaitingReceive,
    /// A receive timed out or the socket failed. Any reply still in flight
    /// would be read as the answer to the next request, so the stream is
    /// unusable until replaced.
    Broken,
}

fn check(state: ChannelState, expected: ChannelState, op: &'static str) -> Result<()> {
    match state {
        ChannelState::Broken => Err(IpcError::Broken),
        s if s == expected => Ok(()),
        s => Err(IpcError::OutOfTurn { op, state: s }),
    }
}

fn map_read_error(err: IpcError, what: &'static str) -> IpcError {
    match err {
        IpcError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            IpcError::Timeout(what)
        }
        other => other,
    }
}

/// Connecting side: send a request, then receive exactly one reply.
#[derive(Debug)]
pub struct ReqChannel {
    path: PathBuf,
    stream: UnixStream,
    state: ChannelState,
    label: &'static str,
}

impl ReqChannel {
    /// Connects to `path`, retrying until `timeout` while the peer comes up.
    pub fn connect(path: &Path, label: &'static str, timeout: Duration) -> Result<Self> {
        let stream = connect_with_retry(path, timeout)?;
        debug!(channel = label, path = %path.display(), "connected");
        Ok(Self {
            path: path.to_path_buf(),
            stream,
            state: ChannelState::AwaitingSend,
            label,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        check(self.state, ChannelState::AwaitingSend, "send")?;
        match write_frame(&mut self.stream, parts) {
            Ok(()) => {
                self.state = ChannelState::AwaitingReceive;
                Ok(())
            }
            Err(e @ IpcError::Malformed(_)) => Err(e),
            Err(e) => {
                self.state = ChannelState::Broken;
                Err(e)
            }
        }
    }

    pub fn recv(&mut self, deadline: Deadline) -> Result<Parts> {
        check(self.state, ChannelState::AwaitingReceive, "recv")?;
        let Some(remaining) = deadline.remaining() else {
            self.state = ChannelState::Broken;
            return Err(IpcError::Timeout(self.label));
        };
        let result = self
            .stream
            .set_read_timeout(Some(remaining))
            .map_err(IpcError::from)
            .and_then(|()| read_frame(&mut self.stream));
        match result {
            Ok(Some(parts)) => {
                self.state = ChannelState::AwaitingSend;
                Ok(parts)
            }
            Ok(None) => {
                self.state = ChannelState::Broken;
                Err(IpcError::Closed)
            }
            Err(e) => {
                self.state = ChannelState::Broken;
                Err(map_read_error(e, self.label))
            }
        }
    }

    /// One full request/reply exchange.
    pub fn request(&mut self, parts: &[&[u8]], deadline: Deadline) -> Result<Parts> {
        self.send(parts)?;
        self.recv(deadline)
    }

    /// Replaces a broken stream with a fresh connection.
    pub fn reconnect(&mut self, timeout: Duration) -> Result<()> {
        self.stream = connect_with_retry(&self.path, timeout)?;
        self.state = ChannelState::AwaitingSend;
        debug!(channel = self.label, path = %self.path.display(), "reconnected");
        Ok(())
    }

    /// Reconnects only if the channel is broken.
    pub fn ensure_ready(&mut self, timeout: Duration) -> Result<()> {
        if self.state == ChannelState::Broken {
            self.reconnect(timeout)?;
        }
        Ok(())
    }
}

/// Accepting side: receive one request, then send exactly one reply.
#[derive(Debug)]
pub struct RepChannel {
    stream: UnixStream,
    state: ChannelState,
}

impl RepChannel {
    pub fn new(stream: UnixStream) -> Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self {
            stream,
            state: ChannelState::AwaitingReceive,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Blocks for the next request. `Ok(None)` means the peer hung up.
    pub fn recv(&mut self) -> Result<Option<Parts>> {
        check(self.state, ChannelState::AwaitingReceive, "recv")?;
        match read_frame(&mut self.stream) {
            Ok(Some(parts)) => {
                self.state = ChannelState::AwaitingSend;
                Ok(Some(parts))
            }
            Ok(None) => {
                self.state = ChannelState::Broken;
                Ok(None)
            }
            Err(e) => {
                self.state = ChannelState::Broken;
                Err(e)
            }
        }
    }

    pub fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        check(self.state, ChannelState::AwaitingSend, "send")?;
        match write_frame(&mut self.stream, parts) {
            Ok(()) => {
                self.state = ChannelState::AwaitingReceive;
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Broken;
                Err(e)
            }
        }
    }
}

fn connect_with_retry(path: &Path, timeout: Duration) -> Result<UnixStream> {
    let deadline = Deadline::after(timeout);
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => {
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e)
                if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused)
                    && !deadline.is_expired() =>
            {
                thread::sleep(CONNECT_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
