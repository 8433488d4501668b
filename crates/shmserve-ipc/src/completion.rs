//! Completion signals, worker → handler.
//!
//! Each handler binds one datagram address derived from its client id. Any
//! worker (or any executor thread of a worker) can post to it without a
//! connection, and a completion always arrives as a whole message.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::frame::{decode, encode};
use crate::message::as_slices;
use crate::{Completion, Deadline, IpcError, Result, SocketLayout};

const MAX_DATAGRAM: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Awaiting { request_id: u64 },
}

/// The handler's reply channel. Expects at most one completion at a time.
#[derive(Debug)]
pub struct CompletionReceiver {
    path: PathBuf,
    socket: UnixDatagram,
    state: ReceiverState,
}

impl CompletionReceiver {
    pub fn bind(layout: &SocketLayout, client_id: &str) -> Result<Self> {
        let path = layout.reply(client_id)?;
        std::fs::create_dir_all(layout.reply_dir())?;
        // A previous process with the same id left its socket behind.
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self {
            path,
            socket,
            state: ReceiverState::Idle,
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Arms the receiver for the completion of `request_id`.
    pub fn arm(&mut self, request_id: u64) -> Result<()> {
        match self.state {
            ReceiverState::Idle => {
                self.state = ReceiverState::Awaiting { request_id };
                Ok(())
            }
            ReceiverState::Awaiting { .. } => Err(IpcError::OutOfTurn {
                op: "arm",
                state: crate::ChannelState::AwaitingReceive,
            }),
        }
    }

    /// Drops the expectation without waiting, for a request that never
    /// reached a worker.
    pub fn disarm(&mut self) {
        self.state = ReceiverState::Idle;
    }

    /// Waits for the armed completion.
    ///
    /// Completions of earlier, abandoned requests are dropped. On timeout the
    /// receiver disarms; if that completion shows up later it is discarded
    /// like any other stale one.
    pub fn wait(&mut self, deadline: Deadline) -> Result<Completion> {
        let ReceiverState::Awaiting { request_id } = self.state else {
            return Err(IpcError::OutOfTurn {
                op: "wait",
                state: crate::ChannelState::AwaitingSend,
            });
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(remaining) = deadline.remaining() else {
                self.state = ReceiverState::Idle;
                return Err(IpcError::Timeout("completion"));
            };
            self.socket.set_read_timeout(Some(remaining))?;
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.state = ReceiverState::Idle;
                    return Err(IpcError::Timeout("completion"));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ReceiverState::Idle;
                    return Err(e.into());
                }
            };
            let completion = match decode(Bytes::copy_from_slice(&buf[..n]))
                .and_then(|parts| Completion::decode(&parts))
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "dropping malformed completion");
                    continue;
                }
            };
            if completion.request_id != request_id {
                warn!(
                    expected = request_id,
                    got = completion.request_id,
                    slot = %completion.grant.slot,
                    "discarding stale completion"
                );
                continue;
            }
            self.state = ReceiverState::Idle;
            return Ok(completion);
        }
    }
}

impl Drop for CompletionReceiver {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Worker side of the reply channels. Caches the resolved address per client.
#[derive(Debug)]
pub struct CompletionSender {
    layout: SocketLayout,
    socket: UnixDatagram,
    routes: HashMap<String, PathBuf>,
}

impl CompletionSender {
    pub fn new(layout: SocketLayout) -> Result<Self> {
        Ok(Self {
            layout,
            socket: UnixDatagram::unbound()?,
            routes: HashMap::new(),
        })
    }

    pub fn send(&mut self, client_id: &str, completion: &Completion) -> Result<()> {
        let path = match self.routes.get(client_id) {
            Some(path) => path.clone(),
            None => {
                let path = self.layout.reply(client_id)?;
                self.routes.insert(client_id.to_string(), path.clone());
                path
            }
        };
        let frame = encode(&as_slices(&completion.encode()))?;
        match self.socket.send_to(&frame, &path) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                // The handler is gone; next time resolve the address afresh.
                self.routes.remove(client_id);
                debug!(client_id, "completion target no longer bound");
                Err(IpcError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shmserve_shm::SlotId;

    use super::*;
    use crate::{CompletionStatus, SlotGrant};

    fn completion(request_id: u64) -> Completion {
        Completion {
            request_id,
            grant: SlotGrant {
                slot: SlotId(0),
                generation: 1,
            },
            status: CompletionStatus::Ok,
        }
    }

    #[test]
    fn delivers_matching_completion() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = SocketLayout::new(dir.path());
        let mut rx = CompletionReceiver::bind(&layout, "7-0")?;
        let mut tx = CompletionSender::new(layout)?;

        rx.arm(5)?;
        tx.send("7-0", &completion(5))?;
        let got = rx.wait(Deadline::after(Duration::from_secs(1)))?;
        assert_eq!(got, completion(5));
        assert_eq!(rx.state(), ReceiverState::Idle);
        Ok(())
    }

    #[test]
    fn stale_completions_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = SocketLayout::new(dir.path());
        let mut rx = CompletionReceiver::bind(&layout, "7-1")?;
        let mut tx = CompletionSender::new(layout)?;

        tx.send("7-1", &completion(1))?;
        rx.arm(2)?;
        tx.send("7-1", &completion(2))?;
        assert_eq!(rx.wait(Deadline::after(Duration::from_secs(1)))?.request_id, 2);
        Ok(())
    }

    #[test]
    fn wait_times_out_and_disarms() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = SocketLayout::new(dir.path());
        let mut rx = CompletionReceiver::bind(&layout, "7-2")?;
        rx.arm(9)?;
        let err = rx.wait(Deadline::after(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(rx.state(), ReceiverState::Idle);
        Ok(())
    }

    #[test]
    fn double_arm_is_out_of_turn() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = SocketLayout::new(dir.path());
        let mut rx = CompletionReceiver::bind(&layout, "7-3")?;
        rx.arm(1)?;
        assert!(matches!(rx.arm(2), Err(IpcError::OutOfTurn { .. })));
        Ok(())
    }

    #[test]
    fn sending_to_departed_handler_is_closed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = SocketLayout::new(dir.path());
        drop(CompletionReceiver::bind(&layout, "7-4")?);
        let mut tx = CompletionSender::new(layout)?;
        assert!(matches!(tx.send("7-4", &completion(1)), Err(IpcError::Closed)));
        Ok(())
    }
}
