//! Cross-context transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Bridge (datapath)            Agent (control plane)      │
//! ├──────────────────────────────────────────────────────────┤
//! │  Pipe: DatapathEnd / AgentEnd, both `Carrier`            │
//! ├──────────────────────────────────────────────────────────┤
//! │  RingChannel: lock-free slots + free ring + CopyStrategy │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The ring never grows. Writers get `ChannelFull` or `FreeListExhausted`
//! back immediately and are expected to drop or retry; readers either poll
//! (`ReadMode::NonBlocking`) or park on a futex until a writer publishes.
//!
//! ```
//! use ccp_bridge::ipc::{Carrier, ChannelConfig, Pipe};
//!
//! let (datapath, agent) = Pipe::new(ChannelConfig::default())?.split();
//! datapath.send(b"measurement")?;
//!
//! let mut buf = [0u8; 64];
//! let len = agent.recv(&mut buf)?;
//! assert_eq!(&buf[..len], b"measurement");
//! # Ok::<(), ccp_bridge::Error>(())
//! ```

pub mod copy;
pub mod pipe;
pub mod ring;

pub use copy::{CopyStrategy, LocalCopy};
pub use pipe::{AgentEnd, Carrier, DatapathEnd, Pipe};
pub use ring::{ChannelConfig, ReadMode, RingChannel};
