use std::sync::{Arc, Mutex};

use ccp_bridge::datapath::{Bridge, BridgeConfig, Datapath, Primitives};
use ccp_bridge::ipc::{AgentEnd, Carrier, ChannelConfig, Pipe};
use ccp_bridge::protocol::{
    DropKind, Frame, Frames, Instruction, Measure, Message, Opcode, Pattern, PatternEvent,
    Primitive, Register,
};
use ccp_bridge::{Error, ManualClock};

/// Shared so the test can inspect directives after handing the datapath to the bridge.
#[derive(Clone, Default)]
struct Host {
    cwnd: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl Datapath for Host {
    type Flow = u32;

    fn set_cwnd(&mut self, flow: &u32, cwnd: u32) {
        self.cwnd.lock().unwrap().push((*flow, cwnd));
    }

    fn set_rate_abs(&mut self, _flow: &u32, _rate: u32) {}

    fn set_rate_rel(&mut self, _flow: &u32, _factor: u32) {}
}

fn drain(agent: &AgentEnd) -> Vec<Frame> {
    let mut buf = [0u8; 4096];
    let mut frames = Vec::new();
    loop {
        let len = agent.recv(&mut buf).unwrap();
        if len == 0 {
            return frames;
        }
        frames.extend(Frames::new(&buf[..len]).map(|frame| frame.unwrap()));
    }
}

fn setup(agent: &AgentEnd, handle: u32) {
    let s = Register::State;
    let p = Register::Primitive;
    let program = [
        Instruction::def(s(2), 1),
        Instruction::new(Opcode::Max, s(0), s(0), p(Primitive::Ack)),
        Instruction::new(Opcode::Ewma, s(1), Register::Immediate(50), p(Primitive::Rtt)),
        Instruction::new(Opcode::Add, s(2), s(2), p(Primitive::Loss)),
        Instruction::new(Opcode::Bind, s(3), p(Primitive::RateIn), Register::Immediate(0)),
        Instruction::new(Opcode::Bind, s(4), p(Primitive::RateOut), Register::Immediate(0)),
    ];
    for instruction in program {
        agent
            .send_frame(&Frame::new(handle, Message::Instruction(instruction)))
            .unwrap();
    }
    let mut pattern = Pattern::new();
    pattern.push(PatternEvent::SetCwndAbs(29_200));
    pattern.push(PatternEvent::WaitAbs(1_000));
    pattern.push(PatternEvent::Report);
    agent
        .send_frame(&Frame::new(handle, Message::Pattern(pattern)))
        .unwrap();
}

#[test]
fn agent_program_drives_measurements() {
    let (datapath_end, agent) = Pipe::new(ChannelConfig::with_capacity(64)).unwrap().split();
    let host = Host::default();
    let clock = ManualClock::new(0);
    let mut bridge = Bridge::new(BridgeConfig::default(), host.clone(), datapath_end, clock.clone()).unwrap();

    let handle = bridge.open_flow(11, 1_000, "vegas").unwrap();
    let created = drain(&agent);
    assert_eq!(created.len(), 1);
    match &created[0].message {
        Message::Create(create) => {
            assert_eq!(created[0].handle, handle);
            assert_eq!(create.start_seq, 1_000);
            assert_eq!(create.algorithm.as_str(), "vegas");
        }
        other => panic!("expected create, got {other:?}"),
    }

    setup(&agent, handle);
    // Six instructions form one program; the pattern counts as one more.
    assert_eq!(bridge.poll().unwrap(), 7);
    assert_eq!(bridge.stats().programs_installed, 1);
    assert_eq!(bridge.flow(handle).unwrap().fold().program().len(), 6);
    // Installing the pattern fires SetCwndAbs at once.
    assert_eq!(*host.cwnd.lock().unwrap(), vec![(11, 29_200)]);

    // First event lands on WaitAbs; the Report comes due 1ms later.
    let event = |ack, rtt, loss| Primitives {
        ack,
        rtt,
        loss,
        rate_in: 8_000,
        rate_out: 9_000,
        cwnd: 29_200,
    };
    bridge.on_event(handle, &event(1_460, 100, 0)).unwrap();
    bridge.on_event(handle, &event(2_920, 300, 1)).unwrap();
    assert!(drain(&agent).is_empty());

    clock.advance_us(1_000);
    bridge.on_event(handle, &event(4_380, 300, 0)).unwrap();
    let reports = drain(&agent);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].handle, handle);
    assert_eq!(
        reports[0].message,
        Message::Measure(Measure {
            ack: 4_380,
            // 0 -> 50 -> 175 -> 237
            rtt: 237,
            loss: 2,
            rate_in: 8_000,
            rate_out: 9_000,
        })
    );
    assert_eq!(bridge.stats().measurements_sent, 1);
}

#[test]
fn drops_and_teardown() {
    let (datapath_end, agent) = Pipe::new(ChannelConfig::with_capacity(64)).unwrap().split();
    let mut bridge = Bridge::new(
        BridgeConfig::default(),
        Host::default(),
        datapath_end,
        ManualClock::new(0),
    )
    .unwrap();
    let handle = bridge.open_flow(1, 0, "reno").unwrap();
    drain(&agent);

    bridge.on_drop(handle, Some(DropKind::Ecn)).unwrap();
    bridge.on_drop(handle, Some(DropKind::Ecn)).unwrap();
    bridge.on_drop(handle, None).unwrap();
    bridge.on_drop(handle, Some(DropKind::Ecn)).unwrap();
    let drops = drain(&agent);
    assert_eq!(drops.len(), 2);
    assert!(drops
        .iter()
        .all(|frame| frame.handle == handle && frame.message == Message::Drop(DropKind::Ecn)));

    assert_eq!(bridge.close_flow(handle), Some(1));
    assert!(matches!(
        bridge.on_event(handle, &Primitives::default()),
        Err(Error::NotFound(_))
    ));

    // Programs for the closed flow are ignored, and the stale handle does
    // not reach the flow that reuses its slot.
    let reused = bridge.open_flow(2, 0, "reno").unwrap();
    assert_ne!(reused, handle);
    setup(&agent, handle);
    assert_eq!(bridge.poll().unwrap(), 0);
    assert!(!bridge.flow(reused).unwrap().fold().is_installed());
}

#[test]
fn full_channel_does_not_fail_the_event_path() {
    let (datapath_end, agent) = Pipe::new(ChannelConfig::with_capacity(4)).unwrap().split();
    let mut bridge = Bridge::new(
        BridgeConfig::default(),
        Host::default(),
        datapath_end,
        ManualClock::new(0),
    )
    .unwrap();
    let handle = bridge.open_flow(1, 0, "reno").unwrap();
    let mut pattern = Pattern::new();
    pattern.push(PatternEvent::Report);
    agent
        .send_frame(&Frame::new(handle, Message::Pattern(pattern)))
        .unwrap();
    bridge.poll().unwrap();

    // Two slots in flight: the Create and the first Report fill the channel.
    for _ in 0..10 {
        bridge.on_event(handle, &Primitives::default()).unwrap();
    }
    assert!(bridge.stats().send_failures > 0);
    assert_eq!(drain(&agent).len(), 2);
}

#[test]
fn program_larger_than_one_read_installs_whole() {
    let (datapath_end, agent) = Pipe::new(ChannelConfig::with_capacity(64)).unwrap().split();
    let mut bridge = Bridge::new(
        BridgeConfig {
            recv_buffer_len: 255,
            ..BridgeConfig::default()
        },
        Host::default(),
        datapath_end,
        ManualClock::new(0),
    )
    .unwrap();
    let handle = bridge.open_flow(1, 0, "reno").unwrap();
    drain(&agent);

    // 30 ten-byte frames: one receive buffer holds 25 of them.
    let add = Instruction::new(
        Opcode::Add,
        Register::State(0),
        Register::State(0),
        Register::Primitive(Primitive::Ack),
    );
    for _ in 0..30 {
        agent
            .send_frame(&Frame::new(handle, Message::Instruction(add)))
            .unwrap();
    }

    assert_eq!(bridge.poll().unwrap(), 30);
    assert_eq!(bridge.poll().unwrap(), 0);
    assert_eq!(bridge.stats().programs_installed, 1);
    assert_eq!(bridge.flow(handle).unwrap().fold().program().len(), 30);

    bridge
        .on_event(handle, &Primitives { ack: 2, ..Primitives::default() })
        .unwrap();
    assert_eq!(bridge.flow(handle).unwrap().fold().state()[0], 60);
}

#[test]
fn run_split_across_reads_ends_at_the_next_frame() {
    let (datapath_end, agent) = Pipe::new(ChannelConfig::with_capacity(64)).unwrap().split();
    let mut bridge = Bridge::new(
        BridgeConfig {
            recv_buffer_len: 255,
            ..BridgeConfig::default()
        },
        Host::default(),
        datapath_end,
        ManualClock::new(0),
    )
    .unwrap();
    let handle = bridge.open_flow(1, 0, "reno").unwrap();
    drain(&agent);

    let bind = Instruction::new(
        Opcode::Bind,
        Register::State(1),
        Register::Primitive(Primitive::Rtt),
        Register::Immediate(0),
    );
    for _ in 0..28 {
        agent
            .send_frame(&Frame::new(handle, Message::Instruction(bind)))
            .unwrap();
    }
    let mut pattern = Pattern::new();
    pattern.push(PatternEvent::WaitAbs(1_000));
    agent
        .send_frame(&Frame::new(handle, Message::Pattern(pattern)))
        .unwrap();

    assert_eq!(bridge.poll().unwrap(), 29);
    assert_eq!(bridge.stats().programs_installed, 1);
    assert_eq!(bridge.stats().patterns_installed, 1);
    assert_eq!(bridge.flow(handle).unwrap().fold().program().len(), 28);
}
