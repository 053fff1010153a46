//! Single-slot result channels.
//!
//! Every argument of a thunk gets one channel, including arguments that are
//! already concrete, so the waiter treats all positions alike. A channel
//! carries at most one [`ChannelMessage`]; reading never blocks.

use super::ipc::{self, LinePoll, LineReader, LineWriter};
use super::protocol::ChannelMessage;
use crate::error::{EngineError, Failure, Result};
use crate::runtime::ResolutionReport;
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

/// What a non-blocking read of a channel produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// Nothing yet.
    Empty,
    /// The delivered value and the report of the subtree that produced it.
    Value {
        value: Value,
        report: ResolutionReport,
    },
    /// The worker reported a failure instead of a value.
    Failed(Failure),
    /// The writer went away without delivering anything.
    Closed,
}

impl From<ChannelMessage> for Received {
    fn from(message: ChannelMessage) -> Self {
        match message {
            ChannelMessage::Value { value, report } => Self::Value { value, report },
            ChannelMessage::Failure { failure } => Self::Failed(failure),
        }
    }
}

/// Reading side of a result channel.
pub trait ResultChannel: Send {
    /// Non-blocking read of the slot.
    fn try_get(&mut self) -> Result<Received>;

    /// Called once the writer is known to be gone; rejects surplus writes.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writing side of a result channel.
pub trait ResultSender: Send {
    /// Store the single message. A second call is a protocol violation.
    fn put(&mut self, message: ChannelMessage) -> Result<()>;
}

/// Channel for an argument that is already a value.
pub struct ReadySlot {
    message: Option<ChannelMessage>,
}

impl ReadySlot {
    pub fn new(value: Value) -> Self {
        Self {
            message: Some(ChannelMessage::value(value, ResolutionReport::default())),
        }
    }
}

impl ResultChannel for ReadySlot {
    fn try_get(&mut self) -> Result<Received> {
        Ok(self.message.take().map_or(Received::Closed, Received::from))
    }
}

/// Create a pipe-backed channel for a forked worker.
pub fn pipe_channel(task: &str) -> Result<(PipeSender, PipeReceiver)> {
    let (read_end, write_end) = ipc::pipe()?;
    Ok((
        PipeSender {
            task: task.to_string(),
            writer: LineWriter::new(write_end),
            sent: false,
        },
        PipeReceiver {
            task: task.to_string(),
            reader: LineReader::new(read_end),
            delivered: false,
        },
    ))
}

/// Worker side of a pipe channel.
pub struct PipeSender {
    task: String,
    writer: LineWriter,
    sent: bool,
}

impl ResultSender for PipeSender {
    fn put(&mut self, message: ChannelMessage) -> Result<()> {
        if self.sent {
            return Err(EngineError::ChannelProtocolViolation {
                task: self.task.clone(),
            });
        }
        self.sent = true;
        self.writer.write_line(&message.to_line()?)?;
        Ok(())
    }
}

/// Initiator side of a pipe channel.
pub struct PipeReceiver {
    task: String,
    reader: LineReader,
    delivered: bool,
}

impl PipeReceiver {
    fn violation(&self) -> EngineError {
        EngineError::ChannelProtocolViolation {
            task: self.task.clone(),
        }
    }
}

impl ResultChannel for PipeReceiver {
    fn try_get(&mut self) -> Result<Received> {
        if self.delivered {
            return Ok(Received::Closed);
        }
        match self.reader.poll_line()? {
            LinePoll::Line(line) => {
                self.delivered = true;
                if self.reader.has_buffered() {
                    return Err(self.violation());
                }
                Ok(ChannelMessage::from_line(&line)?.into())
            }
            LinePoll::Pending => Ok(Received::Empty),
            LinePoll::Eof => Ok(Received::Closed),
        }
    }

    fn finish(&mut self) -> Result<()> {
        let surplus =
            matches!(self.reader.poll_line()?, LinePoll::Line(_)) || self.reader.has_buffered();
        if self.delivered && surplus {
            return Err(self.violation());
        }
        Ok(())
    }
}

/// Create an in-process channel for a thread worker.
pub fn slot_channel(task: &str) -> (SlotSender, SlotReceiver) {
    let (tx, rx) = mpsc::sync_channel(1);
    (
        SlotSender {
            task: task.to_string(),
            tx,
            sent: false,
        },
        SlotReceiver {
            task: task.to_string(),
            rx,
            delivered: false,
        },
    )
}

/// Thread-worker side of an in-process channel.
pub struct SlotSender {
    task: String,
    tx: SyncSender<ChannelMessage>,
    sent: bool,
}

impl ResultSender for SlotSender {
    fn put(&mut self, message: ChannelMessage) -> Result<()> {
        let violation = EngineError::ChannelProtocolViolation {
            task: self.task.clone(),
        };
        if self.sent {
            return Err(violation);
        }
        self.sent = true;
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(violation),
            // Reader already gave up (timeout or sibling failure).
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }
}

/// Initiator side of an in-process channel.
pub struct SlotReceiver {
    task: String,
    rx: Receiver<ChannelMessage>,
    delivered: bool,
}

impl ResultChannel for SlotReceiver {
    fn try_get(&mut self) -> Result<Received> {
        if self.delivered {
            return Ok(Received::Closed);
        }
        match self.rx.try_recv() {
            Ok(message) => {
                self.delivered = true;
                Ok(message.into())
            }
            Err(TryRecvError::Empty) => Ok(Received::Empty),
            Err(TryRecvError::Disconnected) => Ok(Received::Closed),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self.rx.try_recv() {
            Ok(_) if self.delivered => Err(EngineError::ChannelProtocolViolation {
                task: self.task.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value_msg(v: i64) -> ChannelMessage {
        ChannelMessage::value(json!(v), ResolutionReport::default())
    }

    #[test]
    fn test_ready_slot_yields_once() {
        let mut slot = ReadySlot::new(json!(3));
        assert!(matches!(slot.try_get().unwrap(), Received::Value { value, .. } if value == 3));
        assert_eq!(slot.try_get().unwrap(), Received::Closed);
    }

    #[test]
    fn test_pipe_channel_empty_then_value() {
        let _guard = crate::FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (mut tx, mut rx) = pipe_channel("two").unwrap();
        assert_eq!(rx.try_get().unwrap(), Received::Empty);
        tx.put(value_msg(2)).unwrap();
        assert!(matches!(rx.try_get().unwrap(), Received::Value { value, .. } if value == 2));
        drop(tx);
        rx.finish().unwrap();
    }

    #[test]
    fn test_pipe_sender_rejects_second_put() {
        let (mut tx, _rx) = pipe_channel("two").unwrap();
        tx.put(value_msg(2)).unwrap();
        let err = tx.put(value_msg(3)).unwrap_err();
        assert!(matches!(err, EngineError::ChannelProtocolViolation { .. }));
    }

    #[test]
    fn test_pipe_receiver_detects_surplus_write() {
        let (read_end, write_end) = ipc::pipe().unwrap();
        let mut writer = LineWriter::new(write_end);
        let mut rx = PipeReceiver {
            task: "dup".into(),
            reader: LineReader::new(read_end),
            delivered: false,
        };
        writer.write_line(&value_msg(1).to_line().unwrap()).unwrap();
        writer.write_line(&value_msg(2).to_line().unwrap()).unwrap();
        let err = rx.try_get().unwrap_err();
        assert!(matches!(err, EngineError::ChannelProtocolViolation { task } if task == "dup"));
    }

    #[test]
    fn test_pipe_closed_without_value() {
        let _guard = crate::FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, mut rx) = pipe_channel("dead").unwrap();
        drop(tx);
        assert_eq!(rx.try_get().unwrap(), Received::Closed);
    }

    #[test]
    fn test_slot_channel_single_value() {
        let (mut tx, mut rx) = slot_channel("thread");
        assert_eq!(rx.try_get().unwrap(), Received::Empty);
        tx.put(value_msg(7)).unwrap();
        assert!(tx.put(value_msg(8)).is_err());
        assert!(matches!(rx.try_get().unwrap(), Received::Value { value, .. } if value == 7));
        rx.finish().unwrap();
    }

    #[test]
    fn test_failure_is_received() {
        let (mut tx, mut rx) = slot_channel("bad");
        tx.put(ChannelMessage::failure(Failure::Protocol { task: "x".into() }))
            .unwrap();
        assert_eq!(
            rx.try_get().unwrap(),
            Received::Failed(Failure::Protocol { task: "x".into() })
        );
    }
}
