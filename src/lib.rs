//! Control-plane bridge for a programmable congestion-control datapath.
//!
//! The datapath folds per-packet primitives into per-flow state with a small
//! register machine, replays agent-installed control patterns, and exchanges
//! packed binary frames with the agent over a bounded lock-free channel.
//!
//! - [`protocol`]: wire codec for Create/Measure/Drop/Pattern/Instruction frames
//! - [`ipc`]: ring channel, copy strategies and the two-way pipe
//! - [`datapath`]: fold machine, pattern scheduler, connection table, bridge
//! - [`clock`]: time sources for pattern deadlines

pub mod clock;
pub mod datapath;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod wait;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use datapath::{Bridge, BridgeConfig, Datapath, Handle, Primitives};
pub use error::{Error, Result};
pub use ipc::{Carrier, ChannelConfig, Pipe, ReadMode, RingChannel};
pub use protocol::{Frame, Message};
