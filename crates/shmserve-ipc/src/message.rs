//! Typed messages of the control, inference-request and completion channels.

use std::time::Duration;

use bytes::Bytes;
use shmserve_shm::SlotId;

use crate::{IpcError, Parts, Result};

const OP_ACQUIRE: u8 = 0;
const OP_RELEASE: u8 = 1;
const OP_STATS: u8 = 2;

const BUSY: &[u8] = b"BUSY";
const ACK: &[u8] = b"ACK";
const NACK: &[u8] = b"NACK";
const STATS: &[u8] = b"STATS";
const OK: &[u8] = b"OK";
const ERR: &[u8] = b"ERR";

const MAX_DETAIL: usize = 512;

/// A leased slot: which buffers, and the generation the lease was issued at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotGrant {
    pub slot: SlotId,
    pub generation: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    /// Wait at most `wait` for a free slot.
    Acquire { client_id: String, wait: Duration },
    Release(SlotGrant),
    Stats,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub free: u32,
    pub acquired: u32,
    pub in_flight: u32,
    pub waiting: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlReply {
    Granted(SlotGrant),
    /// The acquire budget elapsed before a slot became free.
    Busy,
    Ack,
    Nack(String),
    Stats(PoolStats),
}

impl ControlRequest {
    pub fn encode(&self) -> Vec<Vec<u8>> {
        match self {
            ControlRequest::Acquire { client_id, wait } => vec![
                vec![OP_ACQUIRE],
                client_id.as_bytes().to_vec(),
                (wait.as_millis() as u64).to_le_bytes().to_vec(),
            ],
            ControlRequest::Release(grant) => {
                let mut parts = vec![vec![OP_RELEASE]];
                parts.extend(encode_grant(grant));
                parts
            }
            ControlRequest::Stats => vec![vec![OP_STATS]],
        }
    }

    pub fn decode(parts: &Parts) -> Result<Self> {
        let op = match parts.first().map(|p| p.as_ref()) {
            Some([op]) => *op,
            _ => return Err(IpcError::Malformed("missing control op".into())),
        };
        match (op, parts.len()) {
            (OP_ACQUIRE, 3) => Ok(ControlRequest::Acquire {
                client_id: ascii(&parts[1], "client id")?,
                wait: Duration::from_millis(le_u64(&parts[2], "wait")?),
            }),
            (OP_RELEASE, 4) => Ok(ControlRequest::Release(decode_grant(&parts[1..])?)),
            (OP_STATS, 1) => Ok(ControlRequest::Stats),
            _ => Err(IpcError::Malformed(format!(
                "control op {op} with {} parts",
                parts.len()
            ))),
        }
    }
}

impl ControlReply {
    pub fn encode(&self) -> Vec<Vec<u8>> {
        match self {
            ControlReply::Granted(grant) => encode_grant(grant),
            ControlReply::Busy => vec![BUSY.to_vec()],
            ControlReply::Ack => vec![ACK.to_vec()],
            ControlReply::Nack(reason) => vec![NACK.to_vec(), truncate(reason).into_bytes()],
            ControlReply::Stats(s) => vec![
                STATS.to_vec(),
                s.free.to_le_bytes().to_vec(),
                s.acquired.to_le_bytes().to_vec(),
                s.in_flight.to_le_bytes().to_vec(),
                s.waiting.to_le_bytes().to_vec(),
            ],
        }
    }

    pub fn decode(parts: &Parts) -> Result<Self> {
        let head = parts.first().map(|p| p.as_ref());
        match (head, parts.len()) {
            (Some(BUSY), 1) => Ok(ControlReply::Busy),
            (Some(ACK), 1) => Ok(ControlReply::Ack),
            (Some(NACK), 2) => Ok(ControlReply::Nack(String::from_utf8_lossy(&parts[1]).into_owned())),
            (Some(STATS), 5) => Ok(ControlReply::Stats(PoolStats {
                free: le_u32(&parts[1], "free")?,
                acquired: le_u32(&parts[2], "acquired")?,
                in_flight: le_u32(&parts[3], "in_flight")?,
                waiting: le_u32(&parts[4], "waiting")?,
            })),
            (_, 3) => Ok(ControlReply::Granted(decode_grant(parts)?)),
            _ => Err(IpcError::Malformed(format!("control reply with {} parts", parts.len()))),
        }
    }
}

/// Sent by a handler to a worker once the input buffer is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InferenceMessage {
    pub client_id: String,
    pub grant: SlotGrant,
    pub request_id: u64,
}

impl InferenceMessage {
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let mut parts = vec![self.client_id.as_bytes().to_vec()];
        parts.extend(encode_grant(&self.grant));
        parts.push(self.request_id.to_le_bytes().to_vec());
        parts
    }

    pub fn decode(parts: &Parts) -> Result<Self> {
        if parts.len() != 5 {
            return Err(IpcError::Malformed(format!(
                "inference message with {} parts",
                parts.len()
            )));
        }
        Ok(Self {
            client_id: ascii(&parts[0], "client id")?,
            grant: decode_grant(&parts[1..4])?,
            request_id: le_u64(&parts[4], "request id")?,
        })
    }
}

/// Worker's answer to an [`InferenceMessage`]: queued, or refused outright.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InferenceReply {
    Ack,
    Nack(String),
}

impl InferenceReply {
    pub fn encode(&self) -> Vec<Vec<u8>> {
        match self {
            InferenceReply::Ack => vec![ACK.to_vec()],
            InferenceReply::Nack(reason) => vec![NACK.to_vec(), truncate(reason).into_bytes()],
        }
    }

    pub fn decode(parts: &Parts) -> Result<Self> {
        match (parts.first().map(|p| p.as_ref()), parts.len()) {
            (Some(ACK), 1) => Ok(InferenceReply::Ack),
            (Some(NACK), 2) => Ok(InferenceReply::Nack(
                String::from_utf8_lossy(&parts[1]).into_owned(),
            )),
            _ => Err(IpcError::Malformed(format!(
                "inference reply with {} parts",
                parts.len()
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Failed(String),
}

/// Worker → handler: the slot's output buffer is ready (or the run failed).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub request_id: u64,
    pub grant: SlotGrant,
    pub status: CompletionStatus,
}

impl Completion {
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let mut parts = vec![self.request_id.to_le_bytes().to_vec()];
        parts.extend(encode_grant(&self.grant));
        match &self.status {
            CompletionStatus::Ok => {
                parts.push(OK.to_vec());
                parts.push(Vec::new());
            }
            CompletionStatus::Failed(detail) => {
                parts.push(ERR.to_vec());
                parts.push(truncate(detail).into_bytes());
            }
        }
        parts
    }

    pub fn decode(parts: &Parts) -> Result<Self> {
        if parts.len() != 6 {
            return Err(IpcError::Malformed(format!("completion with {} parts", parts.len())));
        }
        let status = match parts[4].as_ref() {
            OK => CompletionStatus::Ok,
            ERR => CompletionStatus::Failed(String::from_utf8_lossy(&parts[5]).into_owned()),
            other => {
                return Err(IpcError::Malformed(format!(
                    "completion status {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(Self {
            request_id: le_u64(&parts[0], "request id")?,
            grant: decode_grant(&parts[1..4])?,
            status,
        })
    }
}

/// Borrows owned parts for the frame encoder.
pub fn as_slices(parts: &[Vec<u8>]) -> Vec<&[u8]> {
    parts.iter().map(Vec::as_slice).collect()
}

fn encode_grant(grant: &SlotGrant) -> Vec<Vec<u8>> {
    vec![
        grant.slot.input_name().into_bytes(),
        grant.slot.output_name().into_bytes(),
        grant.generation.to_le_bytes().to_vec(),
    ]
}

fn decode_grant(parts: &[Bytes]) -> Result<SlotGrant> {
    let input = ascii(&parts[0], "input name")?;
    let output = ascii(&parts[1], "output name")?;
    let slot = SlotId::from_names(&input, &output).map_err(|e| IpcError::Malformed(e.to_string()))?;
    Ok(SlotGrant {
        slot,
        generation: le_u32(&parts[2], "generation")?,
    })
}

fn ascii(part: &Bytes, what: &str) -> Result<String> {
    if !part.is_ascii() || part.is_empty() {
        return Err(IpcError::Malformed(format!("{what} is not a non-empty ascii string")));
    }
    Ok(String::from_utf8_lossy(part).into_owned())
}

fn le_u64(part: &Bytes, what: &str) -> Result<u64> {
    let raw: [u8; 8] = part
        .as_ref()
        .try_into()
        .map_err(|_| IpcError::Malformed(format!("{what} is not a u64")))?;
    Ok(u64::from_le_bytes(raw))
}

fn le_u32(part: &Bytes, what: &str) -> Result<u32> {
    let raw: [u8; 4] = part
        .as_ref()
        .try_into()
        .map_err(|_| IpcError::Malformed(format!("{what} is not a u32")))?;
    Ok(u32::from_le_bytes(raw))
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_DETAIL {
        return s.to_string();
    }
    let mut end = MAX_DETAIL;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(raw: Vec<Vec<u8>>) -> Parts {
        raw.into_iter().map(Bytes::from).collect()
    }

    fn grant(i: u32, generation: u32) -> SlotGrant {
        SlotGrant {
            slot: SlotId(i),
            generation,
        }
    }

    #[test]
    fn acquire_wire_shape() -> anyhow::Result<()> {
        let req = ControlRequest::Acquire {
            client_id: "41-0".into(),
            wait: Duration::from_millis(250),
        };
        let wire = req.encode();
        assert_eq!(wire[0], vec![0u8]);
        assert_eq!(wire[1], b"41-0".to_vec());
        assert_eq!(ControlRequest::decode(&parts(wire))?, req);
        Ok(())
    }

    #[test]
    fn release_carries_slot_names() -> anyhow::Result<()> {
        let wire = ControlRequest::Release(grant(3, 9)).encode();
        assert_eq!(wire[1], b"input3".to_vec());
        assert_eq!(wire[2], b"output3".to_vec());
        assert_eq!(
            ControlRequest::decode(&parts(wire))?,
            ControlRequest::Release(grant(3, 9))
        );
        Ok(())
    }

    #[test]
    fn replies_are_distinguishable() -> anyhow::Result<()> {
        let stats = PoolStats {
            free: 1,
            acquired: 2,
            in_flight: 3,
            waiting: 4,
        };
        for reply in [
            ControlReply::Granted(grant(0, 1)),
            ControlReply::Busy,
            ControlReply::Ack,
            ControlReply::Nack("slot 0 is not leased".into()),
            ControlReply::Stats(stats),
        ] {
            assert_eq!(ControlReply::decode(&parts(reply.encode()))?, reply);
        }
        Ok(())
    }

    #[test]
    fn unknown_op_is_malformed() {
        let wire = parts(vec![vec![7]]);
        assert!(matches!(ControlRequest::decode(&wire), Err(IpcError::Malformed(_))));
        let wire = parts(vec![vec![0], b"client".to_vec()]);
        assert!(matches!(ControlRequest::decode(&wire), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn inference_message_rejects_mismatched_slots() {
        let mut wire = InferenceMessage {
            client_id: "1-0".into(),
            grant: grant(2, 5),
            request_id: 77,
        }
        .encode();
        wire[2] = b"output3".to_vec();
        assert!(InferenceMessage::decode(&parts(wire)).is_err());
    }

    #[test]
    fn inference_reply_is_ack_or_nack() -> anyhow::Result<()> {
        assert_eq!(InferenceReply::Ack.encode(), vec![b"ACK".to_vec()]);
        let nack = InferenceReply::Nack("slot 1 is not in flight".into());
        assert_eq!(InferenceReply::decode(&parts(nack.encode()))?, nack);
        assert!(InferenceReply::decode(&parts(vec![b"BUSY".to_vec()])).is_err());
        Ok(())
    }

    #[test]
    fn failed_completion_keeps_detail() -> anyhow::Result<()> {
        let completion = Completion {
            request_id: 12,
            grant: grant(1, 4),
            status: CompletionStatus::Failed("executor exploded".into()),
        };
        assert_eq!(Completion::decode(&parts(completion.encode()))?, completion);
        Ok(())
    }

    #[test]
    fn long_details_are_truncated_on_char_boundary() {
        let detail = "é".repeat(MAX_DETAIL);
        let cut = truncate(&detail);
        assert!(cut.len() <= MAX_DETAIL);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
