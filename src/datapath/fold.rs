//! Per-connection signal aggregation.
//!
//! A [`FoldMachine`] owns one connection's register file and its installed
//! program. Every event runs the program once, in order, against the event's
//! [`Primitives`]; state registers persist across events, tmp registers are
//! scratch. Nothing here allocates: programs and registers are fixed arrays.

use arrayvec::ArrayVec;
use log::trace;

use crate::protocol::instruction::{STATE_REGISTERS, TMP_REGISTERS};
use crate::protocol::{Instruction, Measure, Opcode, Primitive, Register};
use crate::Result;

pub const MAX_INSTRUCTIONS: usize = 32;
/// Fixed-point denominator for EWMA weights.
pub const EWMA_DENOM: u64 = 100;

pub type Program = ArrayVec<Instruction, MAX_INSTRUCTIONS>;

/// Measured values for one datapath event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Primitives {
    pub ack: u64,
    pub rtt: u64,
    pub loss: u64,
    pub rate_in: u64,
    pub rate_out: u64,
    pub cwnd: u64,
}

impl Primitives {
    #[inline]
    pub fn get(&self, primitive: Primitive) -> u64 {
        match primitive {
            Primitive::Ack => self.ack,
            Primitive::Rtt => self.rtt,
            Primitive::Loss => self.loss,
            Primitive::RateIn => self.rate_in,
            Primitive::RateOut => self.rate_out,
            Primitive::Cwnd => self.cwnd,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FoldMachine {
    program: Program,
    state: [u64; STATE_REGISTERS],
    tmp: [u64; TMP_REGISTERS],
    /// Length of the leading DEF run.
    defs: usize,
}

impl FoldMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the program and resets the registers.
    ///
    /// The previous program stays in place if any instruction is invalid.
    pub fn install(&mut self, program: Program) -> Result<()> {
        for instruction in &program {
            instruction.encode()?;
        }
        self.program = program;
        self.reset();
        Ok(())
    }

    /// Drops the program; events fall back to the default fold.
    pub fn clear(&mut self) {
        self.program.clear();
        self.reset();
    }

    pub fn is_installed(&self) -> bool {
        !self.program.is_empty()
    }

    pub fn program(&self) -> &[Instruction] {
        &self.program
    }

    /// Zeroes every register, then applies the program's leading DEFs.
    pub fn reset(&mut self) {
        self.state = [0; STATE_REGISTERS];
        self.tmp = [0; TMP_REGISTERS];
        self.defs = 0;
        for i in 0..self.program.len() {
            let instruction = self.program[i];
            if instruction.op != Opcode::Def {
                break;
            }
            if let Register::Immediate(default) = instruction.right {
                self.write(instruction.left, default as u64);
            }
            self.defs += 1;
        }
    }

    /// Runs one pass over the program for this event.
    ///
    /// Without a program every primitive is bound into the state register of
    /// the same index.
    pub fn fold(&mut self, primitives: &Primitives) {
        if self.program.is_empty() {
            for primitive in Primitive::ALL {
                if primitive.index() < STATE_REGISTERS {
                    self.state[primitive.index()] = primitives.get(primitive);
                }
            }
            return;
        }
        // The DEF run only matters at reset.
        for i in self.defs..self.program.len() {
            let instruction = self.program[i];
            self.step(instruction, primitives);
        }
        trace!("fold: {} instructions, state {:?}", self.program.len() - self.defs, self.state);
    }

    fn step(&mut self, instruction: Instruction, primitives: &Primitives) {
        let a = self.read(instruction.left, primitives);
        let b = self.read(instruction.right, primitives);
        let value = match instruction.op {
            Opcode::Add => Some(a.wrapping_add(b)),
            Opcode::Sub => Some(a.wrapping_sub(b)),
            Opcode::Mul => Some(a.wrapping_mul(b)),
            Opcode::Div => Some(a.checked_div(b).unwrap_or(0)),
            Opcode::Equiv => Some((a == b) as u64),
            Opcode::Gt => Some((a > b) as u64),
            Opcode::Lt => Some((a < b) as u64),
            Opcode::Max => Some(a.max(b)),
            Opcode::Min => Some(a.min(b)),
            Opcode::Ewma => {
                let old = self.read(instruction.dest, primitives);
                Some(ewma(a, old, b))
            }
            Opcode::Bind => Some(a),
            Opcode::IfCnt => (a == 1).then(|| b.wrapping_add(1)),
            Opcode::IfNotCnt => (a == 0).then(|| b.wrapping_add(1)),
            // DEFs past the leading run are inert.
            Opcode::Def => None,
        };
        if let Some(value) = value {
            self.write(instruction.dest, value);
        }
    }

    pub fn read(&self, register: Register, primitives: &Primitives) -> u64 {
        match register {
            Register::Immediate(value) => value as u64,
            Register::Primitive(primitive) => primitives.get(primitive),
            Register::Tmp(index) => self.tmp[index as usize],
            Register::State(index) => self.state[index as usize],
        }
    }

    fn write(&mut self, register: Register, value: u64) {
        match register {
            Register::Tmp(index) => self.tmp[index as usize] = value,
            Register::State(index) => self.state[index as usize] = value,
            Register::Immediate(_) | Register::Primitive(_) => {}
        }
    }

    pub fn state(&self) -> &[u64; STATE_REGISTERS] {
        &self.state
    }

    /// Projects the state registers named after the reported primitives.
    pub fn measurement(&self) -> Measure {
        Measure {
            ack: saturate(self.state[Primitive::Ack.index()]),
            rtt: saturate(self.state[Primitive::Rtt.index()]),
            loss: saturate(self.state[Primitive::Loss.index()]),
            rate_in: self.state[Primitive::RateIn.index()],
            rate_out: self.state[Primitive::RateOut.index()],
        }
    }
}

/// `(alpha * new + (DENOM - alpha) * old) / DENOM`; `alpha == 0` yields `new`.
///
/// `alpha` is clamped to `DENOM`. The weighted sum is computed in 128 bits so
/// the result is exact under integer truncation.
#[inline]
pub fn ewma(alpha: u64, old: u64, new: u64) -> u64 {
    if alpha == 0 {
        return new;
    }
    let alpha = alpha.min(EWMA_DENOM) as u128;
    let denom = EWMA_DENOM as u128;
    ((alpha * new as u128 + (denom - alpha) * old as u128) / denom) as u64
}

#[inline]
fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(op: Opcode, dest: Register, left: Register, right: Register) -> Instruction {
        Instruction::new(op, dest, left, right)
    }

    fn program(instructions: &[Instruction]) -> Program {
        instructions.iter().copied().collect()
    }

    fn prims(ack: u64, rtt: u64) -> Primitives {
        Primitives {
            ack,
            rtt,
            ..Primitives::default()
        }
    }

    #[test]
    fn ewma_edges() {
        assert_eq!(ewma(0, 500, 42), 42);
        assert_eq!(ewma(100, 500, 42), 42);
        assert_eq!(ewma(60, 100, 200), 160);
        assert_eq!(ewma(40, 100, 200), 140);
        // Truncates toward zero.
        assert_eq!(ewma(33, 0, 10), 3);
        assert_eq!(ewma(50, u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn default_fold_binds_primitives() {
        let mut machine = FoldMachine::new();
        machine.fold(&Primitives {
            ack: 1,
            rtt: 2,
            loss: 3,
            rate_in: 4,
            rate_out: 5,
            cwnd: 6,
        });
        assert_eq!(&machine.state()[..6], &[1, 2, 3, 4, 5, 6]);
        let m = machine.measurement();
        assert_eq!((m.ack, m.rtt, m.loss, m.rate_in, m.rate_out), (1, 2, 3, 4, 5));
    }

    #[test]
    fn arithmetic_wraps_and_div_by_zero_is_zero() {
        let s = Register::State;
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[
                ins(Opcode::Sub, s(0), Register::Immediate(1), Register::Immediate(2)),
                ins(Opcode::Div, s(1), Register::Immediate(9), Register::Primitive(Primitive::Loss)),
                ins(Opcode::Mul, s(2), Register::Immediate(6), Register::Immediate(7)),
            ]))
            .unwrap();
        machine.fold(&Primitives::default());
        assert_eq!(machine.state()[0], u64::MAX);
        assert_eq!(machine.state()[1], 0);
        assert_eq!(machine.state()[2], 42);
    }

    #[test]
    fn comparisons_and_selection() {
        let s = Register::State;
        let ack = Register::Primitive(Primitive::Ack);
        let rtt = Register::Primitive(Primitive::Rtt);
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[
                ins(Opcode::Equiv, s(0), ack, rtt),
                ins(Opcode::Gt, s(1), ack, rtt),
                ins(Opcode::Lt, s(2), ack, rtt),
                ins(Opcode::Max, s(3), ack, rtt),
                ins(Opcode::Min, s(4), ack, rtt),
            ]))
            .unwrap();
        machine.fold(&prims(10, 3));
        assert_eq!(&machine.state()[..5], &[0, 1, 0, 10, 3]);
    }

    #[test]
    fn def_run_applies_on_install_only() {
        let s = Register::State;
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[
                Instruction::def(s(0), 7),
                Instruction::def(Register::Tmp(0), 3),
                ins(Opcode::Add, s(0), s(0), Register::Tmp(0)),
                // Not leading: ignored at reset and during folds.
                Instruction::def(s(1), 9),
            ]))
            .unwrap();
        assert_eq!(machine.state()[0], 7);
        assert_eq!(machine.state()[1], 0);
        machine.fold(&Primitives::default());
        machine.fold(&Primitives::default());
        assert_eq!(machine.state()[0], 13);
        assert_eq!(machine.state()[1], 0);
    }

    #[test]
    fn writes_are_visible_to_the_next_instruction() {
        let s = Register::State;
        let t = Register::Tmp;
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[
                ins(Opcode::Bind, t(0), Register::Primitive(Primitive::Ack), Register::Immediate(0)),
                ins(Opcode::Add, s(0), t(0), t(0)),
            ]))
            .unwrap();
        machine.fold(&prims(21, 0));
        assert_eq!(machine.state()[0], 42);
    }

    #[test]
    fn ewma_reads_destination_before_write() {
        let s = Register::State;
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[ins(
                Opcode::Ewma,
                s(1),
                Register::Immediate(50),
                Register::Primitive(Primitive::Rtt),
            )]))
            .unwrap();
        machine.fold(&prims(0, 100));
        assert_eq!(machine.state()[1], 50);
        machine.fold(&prims(0, 100));
        assert_eq!(machine.state()[1], 75);
    }

    #[test]
    fn counters_fire_on_condition() {
        let s = Register::State;
        let loss = Register::Primitive(Primitive::Loss);
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[
                ins(Opcode::IfCnt, s(0), loss, s(0)),
                ins(Opcode::IfNotCnt, s(1), loss, s(1)),
            ]))
            .unwrap();
        let lossy = Primitives {
            loss: 1,
            ..Primitives::default()
        };
        machine.fold(&lossy);
        machine.fold(&lossy);
        machine.fold(&Primitives::default());
        machine.fold(&Primitives {
            loss: 5,
            ..Primitives::default()
        });
        assert_eq!(machine.state()[0], 2);
        assert_eq!(machine.state()[1], 1);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let s = Register::State;
        let build = || {
            let mut machine = FoldMachine::new();
            machine
                .install(program(&[
                    Instruction::def(s(2), 1),
                    ins(Opcode::Ewma, s(1), Register::Immediate(20), Register::Primitive(Primitive::Rtt)),
                    ins(Opcode::Max, s(0), s(0), Register::Primitive(Primitive::Ack)),
                    ins(Opcode::Mul, s(2), s(2), Register::Immediate(3)),
                ]))
                .unwrap();
            machine
        };
        let (mut a, mut b) = (build(), build());
        for i in 0..50 {
            let p = prims(i * 7 % 13, 1000 + i);
            a.fold(&p);
            b.fold(&p);
        }
        assert_eq!(a.state(), b.state());
    }

    #[test]
    fn invalid_program_keeps_previous() {
        let s = Register::State;
        let mut machine = FoldMachine::new();
        let good = program(&[ins(Opcode::Add, s(0), s(0), Register::Immediate(1))]);
        machine.install(good.clone()).unwrap();
        let bad = program(&[ins(Opcode::Add, s(40), s(0), Register::Immediate(1))]);
        assert!(machine.install(bad).is_err());
        assert_eq!(machine.program(), &good[..]);
    }

    #[test]
    fn measurement_saturates_narrow_fields() {
        let s = Register::State;
        let mut machine = FoldMachine::new();
        machine
            .install(program(&[
                ins(Opcode::Sub, s(0), Register::Immediate(0), Register::Immediate(1)),
                ins(Opcode::Sub, s(3), Register::Immediate(0), Register::Immediate(1)),
            ]))
            .unwrap();
        machine.fold(&Primitives::default());
        let m = machine.measurement();
        assert_eq!(m.ack, u32::MAX);
        assert_eq!(m.rate_in, u64::MAX);
    }
}
