//! Bidirectional datapath <-> agent transport over two ring channels.
//!
//! ```text
//!   DatapathEnd --send--> [ to_agent ]    --recv--> AgentEnd
//!   DatapathEnd <--recv-- [ to_datapath ] <--send-- AgentEnd
//! ```

use std::sync::Arc;

use crate::ipc::copy::{CopyStrategy, LocalCopy};
use crate::ipc::ring::{ChannelConfig, RingChannel};
use crate::protocol::{self, Frame, MAX_FRAME_LEN};
use crate::Result;

/// A byte transport for framed messages.
pub trait Carrier {
    /// Sends one encoded frame (or several back to back). Never blocks.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Receives whatever fits in `buf`; 0 means nothing was ready.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = protocol::encode(frame, &mut buf)?;
        self.send(&buf[..len])
    }
}

pub struct Pipe<S: CopyStrategy = LocalCopy> {
    to_agent: RingChannel<S>,
    to_datapath: RingChannel<S>,
}

impl Pipe<LocalCopy> {
    /// Both directions share `config`.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        Self::with_configs(config, config, LocalCopy)
    }
}

impl<S: CopyStrategy + Clone> Pipe<S> {
    pub fn with_configs(to_agent: ChannelConfig, to_datapath: ChannelConfig, copy: S) -> Result<Self> {
        Ok(Self {
            to_agent: RingChannel::with_copy(to_agent, copy.clone())?,
            to_datapath: RingChannel::with_copy(to_datapath, copy)?,
        })
    }
}

impl<S: CopyStrategy> Pipe<S> {
    pub fn split(self) -> (DatapathEnd<S>, AgentEnd<S>) {
        let pipe = Arc::new(self);
        (
            DatapathEnd {
                pipe: Arc::clone(&pipe),
            },
            AgentEnd { pipe },
        )
    }

    pub fn to_agent(&self) -> &RingChannel<S> {
        &self.to_agent
    }

    pub fn to_datapath(&self) -> &RingChannel<S> {
        &self.to_datapath
    }
}

/// The latency-critical side: sends measurements, receives programs.
pub struct DatapathEnd<S: CopyStrategy = LocalCopy> {
    pipe: Arc<Pipe<S>>,
}

impl<S: CopyStrategy> DatapathEnd<S> {
    /// Wakes a blocked `recv` on this end.
    pub fn interrupt(&self) {
        self.pipe.to_datapath.interrupt();
    }
}

impl<S: CopyStrategy> Clone for DatapathEnd<S> {
    fn clone(&self) -> Self {
        Self {
            pipe: Arc::clone(&self.pipe),
        }
    }
}

impl<S: CopyStrategy> Carrier for DatapathEnd<S> {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.pipe.to_agent.write(bytes).map(|_| ())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.pipe.to_datapath.read(buf)
    }
}

/// The control side: receives measurements, sends programs and patterns.
pub struct AgentEnd<S: CopyStrategy = LocalCopy> {
    pipe: Arc<Pipe<S>>,
}

impl<S: CopyStrategy> AgentEnd<S> {
    pub fn interrupt(&self) {
        self.pipe.to_agent.interrupt();
    }
}

impl<S: CopyStrategy> Clone for AgentEnd<S> {
    fn clone(&self) -> Self {
        Self {
            pipe: Arc::clone(&self.pipe),
        }
    }
}

impl<S: CopyStrategy> Carrier for AgentEnd<S> {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.pipe.to_datapath.write(bytes).map(|_| ())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.pipe.to_agent.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, DropKind, Message};

    #[test]
    fn directions_are_independent() {
        let (datapath, agent) = Pipe::new(ChannelConfig::with_capacity(8)).unwrap().split();
        datapath.send(b"up").unwrap();
        agent.send(b"down").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(agent.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"up");
        assert_eq!(datapath.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"down");
        assert_eq!(agent.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn send_frame_encodes() {
        let (datapath, agent) = Pipe::new(ChannelConfig::with_capacity(8)).unwrap().split();
        datapath
            .send_frame(&Frame::new(9, Message::Drop(DropKind::Timeout)))
            .unwrap();
        let mut buf = [0u8; 64];
        let len = agent.recv(&mut buf).unwrap();
        let (frame, used) = decode(&buf[..len]).unwrap();
        assert_eq!(used, len);
        assert_eq!(frame, Frame::new(9, Message::Drop(DropKind::Timeout)));
    }
}
