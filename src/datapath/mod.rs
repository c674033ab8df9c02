//! Datapath-side orchestration.
//!
//! A [`Bridge`] owns the connection table for one datapath instance. The
//! latency-critical context drives it with [`Bridge::on_event`] and
//! [`Bridge::on_drop`]; inbound programs and patterns arrive through
//! [`Bridge::deliver`] (or [`Bridge::poll`], which reads the carrier first).
//!
//! ```text
//!   on_event(prims) ──▶ FoldMachine ──▶ PatternScheduler::tick
//!                                             │
//!                   Datapath::set_* ◀──────────┤
//!                   Carrier::send(Measure) ◀───┘ (Report)
//!
//!   deliver(bytes) ──▶ Frames ──▶ Instruction run ──▶ FoldMachine::install
//!                            └──▶ Pattern        ──▶ PatternScheduler::install
//! ```
//!
//! Per-event failures (full channel, unknown handle in a delivery, malformed
//! frame) are logged at debug level and counted; they never reach the event
//! path as errors. Only construction fails hard.

pub mod connection;
pub mod fold;
pub mod pattern;

use log::{debug, info, trace};

pub use connection::{ConnectionTable, Handle, DEFAULT_MAX_FLOWS};
pub use fold::{FoldMachine, Primitives, Program, MAX_INSTRUCTIONS};
pub use pattern::PatternScheduler;

use crate::clock::Clock;
use crate::ipc::Carrier;
use crate::protocol::{
    Create, DropKind, Frame, Frames, Instruction, Message, Pattern, PatternEvent, MAX_FRAME_LEN,
};
use crate::{Error, Result};

pub const DEFAULT_RECV_BUFFER_LEN: usize = 4096;

/// Applies control directives to the flows it owns.
///
/// Values are passed through as the agent sent them: rates are in the
/// agent's fixed-point units, relative factors are hundredths.
pub trait Datapath {
    /// Back-reference to the owner's flow context. The bridge never frees
    /// what it points to.
    type Flow;

    fn set_cwnd(&mut self, flow: &Self::Flow, cwnd: u32);
    fn set_rate_abs(&mut self, flow: &Self::Flow, rate: u32);
    fn set_rate_rel(&mut self, flow: &Self::Flow, factor: u32);
}

#[derive(Clone, Copy, Debug)]
pub struct BridgeConfig {
    pub max_flows: usize,
    /// Bytes pulled from the carrier per `poll`.
    pub recv_buffer_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_flows: DEFAULT_MAX_FLOWS,
            recv_buffer_len: DEFAULT_RECV_BUFFER_LEN,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_flows == 0 || self.max_flows > connection::MAX_SLOTS {
            return Err(Error::Config("max_flows must be in 1..=65535"));
        }
        if self.recv_buffer_len < MAX_FRAME_LEN {
            return Err(Error::Config("recv_buffer_len must hold a full frame"));
        }
        Ok(())
    }
}

/// Everything the bridge keeps for one live flow.
pub struct FlowState<F> {
    flow: F,
    fold: FoldMachine,
    pattern: PatternScheduler,
    last_drop: Option<DropKind>,
    last_rtt_us: u64,
}

impl<F> FlowState<F> {
    fn new(flow: F) -> Self {
        Self {
            flow,
            fold: FoldMachine::new(),
            pattern: PatternScheduler::new(),
            last_drop: None,
            last_rtt_us: 0,
        }
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    pub fn fold(&self) -> &FoldMachine {
        &self.fold
    }

    pub fn pattern(&self) -> &PatternScheduler {
        &self.pattern
    }

    pub fn last_drop(&self) -> Option<DropKind> {
        self.last_drop
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub measurements_sent: u64,
    pub drops_sent: u64,
    pub send_failures: u64,
    pub programs_installed: u64,
    pub patterns_installed: u64,
    pub frames_dropped: u64,
}

/// Instruction frames collected until the run for one handle ends.
struct PendingProgram {
    handle: Handle,
    program: Program,
    overflowed: bool,
}

pub struct Bridge<D: Datapath, T: Carrier, C: Clock> {
    datapath: D,
    carrier: T,
    clock: C,
    flows: ConnectionTable<FlowState<D::Flow>>,
    recv_buf: Box<[u8]>,
    /// Instruction run still open at the end of the last chunk read.
    pending: Option<PendingProgram>,
    stats: BridgeStats,
}

impl<D: Datapath, T: Carrier, C: Clock> Bridge<D, T, C> {
    /// Allocates the connection table and receive buffer. Failure here means
    /// the subsystem must not come up.
    pub fn new(config: BridgeConfig, datapath: D, carrier: T, clock: C) -> Result<Self> {
        config.validate()?;
        let flows = ConnectionTable::with_capacity(config.max_flows)?;
        let mut recv_buf = Vec::new();
        recv_buf
            .try_reserve_exact(config.recv_buffer_len)
            .map_err(|_| Error::Alloc("receive buffer"))?;
        recv_buf.resize(config.recv_buffer_len, 0);
        info!(
            "bridge up: {} flows, {} byte receive buffer",
            config.max_flows, config.recv_buffer_len
        );
        Ok(Self {
            datapath,
            carrier,
            clock,
            flows,
            recv_buf: recv_buf.into_boxed_slice(),
            pending: None,
            stats: BridgeStats::default(),
        })
    }

    pub fn datapath(&self) -> &D {
        &self.datapath
    }

    pub fn datapath_mut(&mut self) -> &mut D {
        &mut self.datapath
    }

    pub fn carrier(&self) -> &T {
        &self.carrier
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn flow(&self, handle: Handle) -> Result<&FlowState<D::Flow>> {
        self.flows.lookup(handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.flows.iter().map(|(handle, _)| handle)
    }

    /// Admits a flow and announces it to the agent.
    ///
    /// A failed Create send is logged; the flow stays admitted.
    pub fn open_flow(&mut self, flow: D::Flow, start_seq: u32, algorithm: &str) -> Result<Handle> {
        let create = Message::Create(Create::new(start_seq, algorithm)?);
        if create.encoded_len() > MAX_FRAME_LEN {
            return Err(Error::MessageTooLarge(create.encoded_len()));
        }
        let handle = self.flows.start(FlowState::new(flow))?;
        if let Err(err) = self
            .carrier
            .send_frame(&Frame::new(handle, create))
        {
            self.stats.send_failures += 1;
            debug!("flow {handle:#x}: create not sent: {err}");
        }
        info!("flow {handle:#x} opened ({algorithm}, start_seq {start_seq})");
        Ok(handle)
    }

    /// Removes the flow and hands its back-reference to the owner.
    pub fn close_flow(&mut self, handle: Handle) -> Option<D::Flow> {
        match self.flows.free(handle) {
            Ok(state) => {
                info!("flow {handle:#x} closed");
                Some(state.flow)
            }
            Err(err) => {
                debug!("close ignored: {err}");
                None
            }
        }
    }

    /// Per-event entry point: fold the primitives, then advance the pattern
    /// and dispatch whatever directive came due.
    ///
    /// Only an unknown handle is reported; everything else is best effort.
    pub fn on_event(&mut self, handle: Handle, primitives: &Primitives) -> Result<()> {
        let now_us = self.clock.now_us();
        let state = self.flows.lookup_mut(handle)?;
        state.fold.fold(primitives);
        state.last_rtt_us = primitives.rtt;
        if let Some(event) = state.pattern.tick(now_us, primitives.rtt) {
            dispatch(
                &mut self.datapath,
                &self.carrier,
                &mut self.stats,
                handle,
                state,
                event,
            );
        }
        Ok(())
    }

    /// Reports a congestion signal. Repeats of the last reported kind are
    /// suppressed; `None` marks the return to normal operation and re-arms.
    pub fn on_drop(&mut self, handle: Handle, drop: Option<DropKind>) -> Result<()> {
        let state = self.flows.lookup_mut(handle)?;
        let Some(kind) = drop else {
            state.last_drop = None;
            return Ok(());
        };
        if state.last_drop == Some(kind) {
            trace!("flow {handle:#x}: {} already reported", kind.as_str());
            return Ok(());
        }
        state.last_drop = Some(kind);
        match self
            .carrier
            .send_frame(&Frame::new(handle, Message::Drop(kind)))
        {
            Ok(()) => self.stats.drops_sent += 1,
            Err(err) => {
                self.stats.send_failures += 1;
                debug!("flow {handle:#x}: drop notification not sent: {err}");
            }
        }
        Ok(())
    }

    /// Reads whatever the carrier has and applies it. Returns the number of
    /// frames applied.
    ///
    /// A chunk that ends inside an Instruction run keeps the run open and
    /// reads on; the program is installed once the run ends or the carrier
    /// has nothing more.
    pub fn poll(&mut self) -> Result<usize> {
        let mut buf = std::mem::take(&mut self.recv_buf);
        let mut applied = 0;
        let outcome = loop {
            match self.carrier.recv(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(len) => {
                    applied += self.apply_frames(&buf[..len]);
                    if self.pending.is_none() {
                        break Ok(());
                    }
                }
                Err(err) => break Err(err),
            }
        };
        self.recv_buf = buf;
        outcome?;
        Ok(applied + self.finish_program())
    }

    /// Applies a buffer of back-to-back frames from the agent and returns the
    /// number applied.
    ///
    /// Consecutive Instruction frames for one handle form one program,
    /// installed only when the run ends; a decode error inside a run discards
    /// the whole run. The buffer is taken to be complete: a run still open at
    /// its end is installed.
    pub fn deliver(&mut self, bytes: &[u8]) -> usize {
        self.apply_frames(bytes) + self.finish_program()
    }

    fn finish_program(&mut self) -> usize {
        match self.pending.take() {
            Some(run) => self.install_program(run),
            None => 0,
        }
    }

    /// Applies frames, leaving a trailing Instruction run in `self.pending`.
    fn apply_frames(&mut self, bytes: &[u8]) -> usize {
        let mut applied = 0;
        let mut pending = self.pending.take();
        for frame in Frames::new(bytes) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    self.stats.frames_dropped += 1;
                    debug!("inbound frame dropped: {err}");
                    if let Some(run) = pending.take() {
                        self.stats.frames_dropped += run.program.len() as u64;
                        debug!("flow {:#x}: program discarded with bad frame", run.handle);
                    }
                    continue;
                }
            };
            match frame.message {
                Message::Instruction(instruction) => {
                    match pending.as_mut() {
                        Some(run) if run.handle == frame.handle => push(run, instruction),
                        _ => {
                            if let Some(run) = pending.take() {
                                applied += self.install_program(run);
                            }
                            let mut run = PendingProgram {
                                handle: frame.handle,
                                program: Program::new(),
                                overflowed: false,
                            };
                            push(&mut run, instruction);
                            pending = Some(run);
                        }
                    }
                }
                message => {
                    if let Some(run) = pending.take() {
                        applied += self.install_program(run);
                    }
                    applied += self.apply(frame.handle, message);
                }
            }
        }
        self.pending = pending;
        applied
    }

    fn install_program(&mut self, run: PendingProgram) -> usize {
        let count = run.program.len();
        if run.overflowed {
            self.stats.frames_dropped += count as u64;
            debug!(
                "flow {:#x}: program exceeds {MAX_INSTRUCTIONS} instructions",
                run.handle
            );
            return 0;
        }
        let state = match self.flows.lookup_mut(run.handle) {
            Ok(state) => state,
            Err(err) => {
                self.stats.frames_dropped += count as u64;
                debug!("program dropped: {err}");
                return 0;
            }
        };
        if let Err(err) = state.fold.install(run.program) {
            self.stats.frames_dropped += count as u64;
            debug!("flow {:#x}: program rejected: {err}", run.handle);
            return 0;
        }
        self.stats.programs_installed += 1;
        info!("flow {:#x}: installed {count}-instruction program", run.handle);
        count
    }

    fn apply(&mut self, handle: Handle, message: Message) -> usize {
        let kind = message.kind();
        let Message::Pattern(events) = message else {
            self.stats.frames_dropped += 1;
            debug!("flow {handle:#x}: unexpected {kind:?} frame from agent");
            return 0;
        };
        let state = match self.flows.lookup_mut(handle) {
            Ok(state) => state,
            Err(err) => {
                self.stats.frames_dropped += 1;
                debug!("pattern dropped: {err}");
                return 0;
            }
        };
        install_pattern(state, events, self.clock.now_us());
        self.stats.patterns_installed += 1;
        // The first event is due right away.
        if let Some(event) = state.pattern.tick(self.clock.now_us(), state.last_rtt_us) {
            dispatch(
                &mut self.datapath,
                &self.carrier,
                &mut self.stats,
                handle,
                state,
                event,
            );
        }
        1
    }
}

fn push(run: &mut PendingProgram, instruction: Instruction) {
    if run.program.try_push(instruction).is_err() {
        run.overflowed = true;
    }
}

fn install_pattern<F>(state: &mut FlowState<F>, events: Pattern, now_us: u64) {
    debug!("installing {}-event pattern: {:?}", events.len(), events.as_slice());
    state.pattern.install(events, now_us);
}

fn dispatch<D: Datapath, T: Carrier>(
    datapath: &mut D,
    carrier: &T,
    stats: &mut BridgeStats,
    handle: Handle,
    state: &mut FlowState<D::Flow>,
    event: PatternEvent,
) {
    trace!("flow {handle:#x}: {event:?}");
    match event {
        PatternEvent::SetCwndAbs(cwnd) => datapath.set_cwnd(&state.flow, cwnd),
        PatternEvent::SetRateAbs(rate) => datapath.set_rate_abs(&state.flow, rate),
        PatternEvent::SetRateRel(factor) => datapath.set_rate_rel(&state.flow, factor),
        PatternEvent::WaitAbs(_) | PatternEvent::WaitRel(_) => {}
        PatternEvent::Report => {
            let measure = state.fold.measurement();
            match carrier.send_frame(&Frame::new(handle, Message::Measure(measure))) {
                Ok(()) => stats.measurements_sent += 1,
                Err(err) => {
                    // Superseded by the next report.
                    stats.send_failures += 1;
                    debug!("flow {handle:#x}: measurement not sent: {err}");
                }
            }
        }
    }
}
