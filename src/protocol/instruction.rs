//! Fold instruction encoding.
//!
//! An instruction travels as four bytes: `opcode, dest, left, right`. Each
//! register byte carries its kind in the top two bits and an index (or an
//! inline immediate) in the low six bits:
//!
//! ```text
//!   7 6 5 4 3 2 1 0
//!  +---+-----------+
//!  |kind|  index   |   kind: 0 immediate, 1 primitive, 2 tmp, 3 state
//!  +---+-----------+
//! ```
//!
//! Register indices and primitive kinds are validated here, at decode time, so
//! the fold machine never sees an unreadable register.

use crate::{Error, Result};

pub const INSTRUCTION_LEN: usize = 4;
pub const STATE_REGISTERS: usize = 8;
pub const TMP_REGISTERS: usize = 8;
pub const MAX_IMMEDIATE: u8 = 0x3f;

const KIND_SHIFT: u8 = 6;
const INDEX_MASK: u8 = 0x3f;
const KIND_IMMEDIATE: u8 = 0;
const KIND_PRIMITIVE: u8 = 1;
const KIND_TMP: u8 = 2;
const KIND_STATE: u8 = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add = 0,
    Bind = 1,
    Div = 2,
    Equiv = 3,
    Ewma = 4,
    Gt = 5,
    IfCnt = 6,
    Lt = 8,
    Max = 9,
    Min = 10,
    Mul = 11,
    IfNotCnt = 12,
    Sub = 13,
    Def = 14,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Opcode::Add,
            1 => Opcode::Bind,
            2 => Opcode::Div,
            3 => Opcode::Equiv,
            4 => Opcode::Ewma,
            5 => Opcode::Gt,
            6 => Opcode::IfCnt,
            8 => Opcode::Lt,
            9 => Opcode::Max,
            10 => Opcode::Min,
            11 => Opcode::Mul,
            12 => Opcode::IfNotCnt,
            13 => Opcode::Sub,
            14 => Opcode::Def,
            _ => return Err(Error::Malformed("unknown opcode")),
        })
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Per-event measured values the datapath owner exposes to fold programs.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Ack = 0,
    Rtt = 1,
    Loss = 2,
    RateIn = 3,
    RateOut = 4,
    Cwnd = 5,
}

impl Primitive {
    pub const ALL: [Primitive; 6] = [
        Primitive::Ack,
        Primitive::Rtt,
        Primitive::Loss,
        Primitive::RateIn,
        Primitive::RateOut,
        Primitive::Cwnd,
    ];

    pub fn from_index(index: u8) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or(Error::Malformed("unknown primitive register"))
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Immediate(u8),
    Primitive(Primitive),
    Tmp(u8),
    State(u8),
}

impl Register {
    pub fn decode(byte: u8) -> Result<Self> {
        let index = byte & INDEX_MASK;
        match byte >> KIND_SHIFT {
            KIND_IMMEDIATE => Ok(Register::Immediate(index)),
            KIND_PRIMITIVE => Primitive::from_index(index).map(Register::Primitive),
            KIND_TMP if (index as usize) < TMP_REGISTERS => Ok(Register::Tmp(index)),
            KIND_TMP => Err(Error::Malformed("tmp register out of range")),
            KIND_STATE if (index as usize) < STATE_REGISTERS => Ok(Register::State(index)),
            _ => Err(Error::Malformed("state register out of range")),
        }
    }

    pub fn encode(self) -> Result<u8> {
        let (kind, index) = match self {
            Register::Immediate(value) if value <= MAX_IMMEDIATE => (KIND_IMMEDIATE, value),
            Register::Immediate(_) => return Err(Error::Malformed("immediate exceeds six bits")),
            Register::Primitive(primitive) => (KIND_PRIMITIVE, primitive as u8),
            Register::Tmp(index) if (index as usize) < TMP_REGISTERS => (KIND_TMP, index),
            Register::Tmp(_) => return Err(Error::Malformed("tmp register out of range")),
            Register::State(index) if (index as usize) < STATE_REGISTERS => (KIND_STATE, index),
            Register::State(_) => return Err(Error::Malformed("state register out of range")),
        };
        Ok((kind << KIND_SHIFT) | index)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, Register::Tmp(_) | Register::State(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: Opcode,
    pub dest: Register,
    pub left: Register,
    pub right: Register,
}

impl Instruction {
    pub fn new(op: Opcode, dest: Register, left: Register, right: Register) -> Self {
        Self {
            op,
            dest,
            left,
            right,
        }
    }

    /// `DEF left := right`, applied when the program is reset.
    pub fn def(target: Register, default: u8) -> Self {
        Self::new(Opcode::Def, target, target, Register::Immediate(default))
    }

    /// Structural checks that do not depend on register contents.
    pub fn validate(&self) -> Result<()> {
        match self.op {
            Opcode::Def => {
                if !self.left.is_writable() {
                    return Err(Error::Malformed("DEF target is not writable"));
                }
                if !matches!(self.right, Register::Immediate(_)) {
                    return Err(Error::Malformed("DEF default must be an immediate"));
                }
            }
            _ => {
                if !self.dest.is_writable() {
                    return Err(Error::Malformed("destination register is not writable"));
                }
            }
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INSTRUCTION_LEN {
            return Err(Error::Truncated {
                needed: INSTRUCTION_LEN,
                available: bytes.len(),
            });
        }
        let instruction = Self {
            op: Opcode::from_u8(bytes[0])?,
            dest: Register::decode(bytes[1])?,
            left: Register::decode(bytes[2])?,
            right: Register::decode(bytes[3])?,
        };
        instruction.validate()?;
        Ok(instruction)
    }

    pub fn encode(&self) -> Result<[u8; INSTRUCTION_LEN]> {
        self.validate()?;
        Ok([
            self.op.as_u8(),
            self.dest.encode()?,
            self.left.encode()?,
            self.right.encode()?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_byte_layout() {
        assert_eq!(Register::Immediate(5).encode().unwrap(), 0b0000_0101);
        assert_eq!(Register::Primitive(Primitive::Rtt).encode().unwrap(), 0b0100_0001);
        assert_eq!(Register::Tmp(2).encode().unwrap(), 0b1000_0010);
        assert_eq!(Register::State(7).encode().unwrap(), 0b1100_0111);
        assert_eq!(Register::decode(0b1100_0011).unwrap(), Register::State(3));
    }

    #[test]
    fn unknown_primitive_is_rejected_at_decode() {
        let err = Register::decode((1 << 6) | 17).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn out_of_range_registers_are_rejected() {
        assert!(Register::decode((3 << 6) | STATE_REGISTERS as u8).is_err());
        assert!(Register::decode((2 << 6) | 63).is_err());
        assert!(Register::State(40).encode().is_err());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(Opcode::from_u8(7).is_err());
        assert!(Instruction::decode(&[15, 0xc0, 0xc0, 0xc0]).is_err());
    }

    #[test]
    fn immediate_destination_is_rejected() {
        let err = Instruction::decode(&[Opcode::Add as u8, 0x01, 0xc0, 0xc1]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn def_requires_immediate_default() {
        let def = Instruction::new(
            Opcode::Def,
            Register::State(0),
            Register::State(0),
            Register::Primitive(Primitive::Ack),
        );
        assert!(def.validate().is_err());
        assert!(Instruction::def(Register::Tmp(1), 9).validate().is_ok());
    }

    #[test]
    fn instruction_bytes_round_trip() {
        let ewma = Instruction::new(
            Opcode::Ewma,
            Register::State(1),
            Register::Immediate(40),
            Register::Primitive(Primitive::Rtt),
        );
        let bytes = ewma.encode().unwrap();
        assert_eq!(bytes, [4, 0xc1, 40, 0x41]);
        assert_eq!(Instruction::decode(&bytes).unwrap(), ewma);
    }
}
