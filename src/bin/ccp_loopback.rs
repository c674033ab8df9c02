use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use hdrhistogram::Histogram;
use log::{debug, info, warn};

use ccp_bridge::datapath::{Bridge, BridgeConfig, Datapath, Primitives};
use ccp_bridge::ipc::{AgentEnd, Carrier, ChannelConfig, LocalCopy, Pipe, ReadMode};
use ccp_bridge::protocol::{
    DropKind, Frame, Frames, Instruction, Message, Opcode, Pattern, PatternEvent, Primitive,
    Register,
};
use ccp_bridge::{Error, ManualClock};

const MSS: u64 = 1_460;

#[derive(Parser, Debug)]
#[command(name = "ccp-loopback", version, about = "Simulated datapath and agent over an in-process pipe")]
struct Args {
    /// Number of simulated flows
    #[arg(long, default_value_t = 4)]
    flows: usize,

    /// Events per flow
    #[arg(long, default_value_t = 100_000)]
    events: u64,

    /// Simulated time between events, in microseconds
    #[arg(long, default_value_t = 10)]
    event_interval_us: u64,

    /// Base round-trip time of the simulated path, in microseconds
    #[arg(long, default_value_t = 1_000)]
    rtt_us: u64,

    /// Ring slots per direction
    #[arg(long, default_value_t = 1024)]
    capacity: usize,

    /// Park the agent on the ring instead of polling
    #[arg(long)]
    blocking: bool,

    /// Inject a dupack drop every N events (0 disables)
    #[arg(long, default_value_t = 5_000)]
    drop_every: u64,
}

#[derive(Default)]
struct SimFlow {
    cwnd: u32,
    rate: u32,
}

struct SimDatapath {
    flows: Vec<SimFlow>,
}

impl Datapath for SimDatapath {
    type Flow = usize;

    fn set_cwnd(&mut self, flow: &usize, cwnd: u32) {
        if let Some(sim) = self.flows.get_mut(*flow) {
            sim.cwnd = cwnd;
        }
    }

    fn set_rate_abs(&mut self, flow: &usize, rate: u32) {
        if let Some(sim) = self.flows.get_mut(*flow) {
            sim.rate = rate;
        }
    }

    fn set_rate_rel(&mut self, flow: &usize, factor: u32) {
        if let Some(sim) = self.flows.get_mut(*flow) {
            sim.rate = ((sim.rate as u64 * factor as u64) / 100).min(u32::MAX as u64) as u32;
        }
    }
}

#[derive(Default)]
struct AgentReport {
    creates: u64,
    measurements: u64,
    drops: u64,
    bad_frames: u64,
    send_failures: u64,
    srtt_us: Option<Histogram<u64>>,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let to_agent = ChannelConfig {
        capacity: args.capacity,
        read_mode: if args.blocking {
            ReadMode::Blocking { spin_us: 50 }
        } else {
            ReadMode::NonBlocking
        },
        ..ChannelConfig::default()
    };
    // The datapath polls; it must never park.
    let to_datapath = ChannelConfig {
        capacity: args.capacity,
        read_mode: ReadMode::NonBlocking,
        ..ChannelConfig::default()
    };
    let (datapath_end, agent_end) = Pipe::with_configs(to_agent, to_datapath, LocalCopy)
        .context("failed to allocate pipe")?
        .split();

    let stop = Arc::new(AtomicBool::new(false));
    let agent = {
        let agent_end = agent_end.clone();
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("ccp-agent".into())
            .spawn(move || run_agent(agent_end, stop))
            .context("failed to spawn agent")?
    };

    let clock = ManualClock::new(0);
    let sim = SimDatapath {
        flows: (0..args.flows).map(|_| SimFlow::default()).collect(),
    };
    let mut bridge = Bridge::new(
        BridgeConfig {
            max_flows: args.flows.max(1),
            ..BridgeConfig::default()
        },
        sim,
        datapath_end,
        clock.clone(),
    )
    .context("failed to start bridge")?;

    let handles = (0..args.flows)
        .map(|flow| bridge.open_flow(flow, 0, "loopback"))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to open flows")?;
    info!("opened {} flows", handles.len());

    let started = Instant::now();
    for event in 0..args.events {
        clock.advance_us(args.event_interval_us);
        for (flow, &handle) in handles.iter().enumerate() {
            let primitives = Primitives {
                ack: (event + 1) * MSS,
                rtt: args.rtt_us + (event * 7 + flow as u64 * 13) % (args.rtt_us / 4 + 1),
                loss: 0,
                rate_in: 10_000_000,
                rate_out: 10_000_000 - (event % 100) * 1_000,
                cwnd: bridge.datapath().flows[flow].cwnd as u64,
            };
            bridge.on_event(handle, &primitives)?;
            if args.drop_every > 0 {
                if event % args.drop_every == args.drop_every - 1 {
                    bridge.on_drop(handle, Some(DropKind::Dupack))?;
                } else if event % args.drop_every == 0 {
                    bridge.on_drop(handle, None)?;
                }
            }
        }
        match bridge.poll() {
            Ok(_) => {}
            Err(err) => debug!("poll failed: {err}"),
        }
    }
    let elapsed = started.elapsed();

    for handle in handles {
        bridge.close_flow(handle);
    }
    stop.store(true, Ordering::Release);
    agent_end.interrupt();
    let report = agent
        .join()
        .map_err(|_| anyhow::anyhow!("agent thread panicked"))??;

    let stats = bridge.stats();
    let total_events = args.events * args.flows as u64;
    println!("events:              {total_events}");
    println!(
        "elapsed:             {:.3}s ({:.0} events/s)",
        elapsed.as_secs_f64(),
        total_events as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("measurements sent:   {}", stats.measurements_sent);
    println!("drops sent:          {}", stats.drops_sent);
    println!("send failures:       {}", stats.send_failures);
    println!("programs installed:  {}", stats.programs_installed);
    println!("patterns installed:  {}", stats.patterns_installed);
    println!("frames dropped:      {}", stats.frames_dropped);
    println!("agent creates:       {}", report.creates);
    println!("agent measurements:  {}", report.measurements);
    println!("agent drops:         {}", report.drops);
    println!("agent bad frames:    {}", report.bad_frames);
    println!("agent send failures: {}", report.send_failures);
    if let Some(histogram) = report.srtt_us.filter(|h| !h.is_empty()) {
        println!(
            "srtt us p50/p99/max: {}/{}/{}",
            histogram.value_at_quantile(0.50),
            histogram.value_at_quantile(0.99),
            histogram.max()
        );
    }
    Ok(())
}

fn run_agent(end: AgentEnd, stop: Arc<AtomicBool>) -> Result<AgentReport> {
    let mut report = AgentReport {
        srtt_us: Some(Histogram::<u64>::new(3)?),
        ..AgentReport::default()
    };
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let len = match end.recv(&mut buf) {
            Ok(0) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(Duration::from_micros(50));
                continue;
            }
            Ok(len) => len,
            Err(Error::Interrupted) if stop.load(Ordering::Acquire) => break,
            Err(Error::Interrupted) => continue,
            Err(err) => return Err(err.into()),
        };
        for frame in Frames::new(&buf[..len]) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    report.bad_frames += 1;
                    warn!("agent: bad frame: {err}");
                    continue;
                }
            };
            match frame.message {
                Message::Create(create) => {
                    report.creates += 1;
                    debug!("agent: flow {:#x} created ({})", frame.handle, create.algorithm);
                    for frame in flow_setup(frame.handle) {
                        if let Err(err) = end.send_frame(&frame) {
                            report.send_failures += 1;
                            debug!("agent: setup frame not sent: {err}");
                        }
                    }
                }
                Message::Measure(measure) => {
                    report.measurements += 1;
                    if let Some(histogram) = report.srtt_us.as_mut() {
                        let _ = histogram.record(measure.rtt as u64);
                    }
                }
                Message::Drop(kind) => {
                    report.drops += 1;
                    debug!("agent: flow {:#x} drop {}", frame.handle, kind.as_str());
                }
                other => {
                    report.bad_frames += 1;
                    warn!("agent: unexpected {:?} frame", other.kind());
                }
            }
        }
    }
    Ok(report)
}

/// Smoothed RTT, max ack and raw rates, then a cwnd-and-report cycle once per RTT.
fn flow_setup(handle: u32) -> Vec<Frame> {
    let state = Register::State;
    let prim = Register::Primitive;
    let program = [
        Instruction::new(Opcode::Max, state(0), state(0), prim(Primitive::Ack)),
        Instruction::new(Opcode::Ewma, state(1), Register::Immediate(20), prim(Primitive::Rtt)),
        Instruction::new(Opcode::Add, state(2), state(2), prim(Primitive::Loss)),
        Instruction::new(Opcode::Bind, state(3), prim(Primitive::RateIn), Register::Immediate(0)),
        Instruction::new(Opcode::Bind, state(4), prim(Primitive::RateOut), Register::Immediate(0)),
    ];
    let mut frames: Vec<Frame> = program
        .into_iter()
        .map(|instruction| Frame::new(handle, Message::Instruction(instruction)))
        .collect();

    let mut pattern = Pattern::new();
    pattern.push(PatternEvent::SetCwndAbs(10 * MSS as u32));
    pattern.push(PatternEvent::Report);
    pattern.push(PatternEvent::WaitRel(100));
    frames.push(Frame::new(handle, Message::Pattern(pattern)));
    frames
}
