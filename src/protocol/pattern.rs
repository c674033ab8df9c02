//! Pattern event encoding.
//!
//! Each event is `{type: u8, size: u8, value: u32}`; `size` is the encoded
//! event length, 2 for Report (no value) and 6 for everything else.

use crate::{Error, Result};

pub const EVENT_HEADER_LEN: usize = 2;
pub const EVENT_VALUE_LEN: usize = 6;
pub const MAX_PATTERN_EVENTS: usize = 32;

const SET_RATE_ABS: u8 = 0;
const SET_CWND_ABS: u8 = 1;
const SET_RATE_REL: u8 = 2;
const WAIT_ABS: u8 = 3;
const WAIT_REL: u8 = 4;
const REPORT: u8 = 5;

/// A timed control directive.
///
/// Relative values are fixed point with two decimals: `SetRateRel(150)` scales
/// the current rate by 1.5, `WaitRel(50)` waits half an RTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternEvent {
    /// Pacing rate in bytes per second.
    SetRateAbs(u32),
    /// Congestion window in bytes.
    SetCwndAbs(u32),
    SetRateRel(u32),
    /// Wait in microseconds.
    WaitAbs(u32),
    WaitRel(u32),
    Report,
}

impl PatternEvent {
    #[inline]
    pub const fn encoded_len(&self) -> usize {
        match self {
            PatternEvent::Report => EVENT_HEADER_LEN,
            _ => EVENT_VALUE_LEN,
        }
    }

    pub const fn type_code(&self) -> u8 {
        match self {
            PatternEvent::SetRateAbs(_) => SET_RATE_ABS,
            PatternEvent::SetCwndAbs(_) => SET_CWND_ABS,
            PatternEvent::SetRateRel(_) => SET_RATE_REL,
            PatternEvent::WaitAbs(_) => WAIT_ABS,
            PatternEvent::WaitRel(_) => WAIT_REL,
            PatternEvent::Report => REPORT,
        }
    }

    /// Writes the event at the start of `buf`; `buf` must hold `encoded_len()` bytes.
    pub(crate) fn write_to(&self, buf: &mut [u8]) -> usize {
        let len = self.encoded_len();
        buf[0] = self.type_code();
        buf[1] = len as u8;
        let value = match *self {
            PatternEvent::SetRateAbs(v)
            | PatternEvent::SetCwndAbs(v)
            | PatternEvent::SetRateRel(v)
            | PatternEvent::WaitAbs(v)
            | PatternEvent::WaitRel(v) => v,
            PatternEvent::Report => return len,
        };
        buf[2..6].copy_from_slice(&value.to_le_bytes());
        len
    }

    /// Reads one event from the start of `buf`, returning it and its length.
    pub(crate) fn read_from(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < EVENT_HEADER_LEN {
            return Err(Error::Truncated {
                needed: EVENT_HEADER_LEN,
                available: buf.len(),
            });
        }
        let (type_code, size) = (buf[0], buf[1] as usize);
        if type_code == REPORT {
            if size != EVENT_HEADER_LEN {
                return Err(Error::Malformed("report event size mismatch"));
            }
            return Ok((PatternEvent::Report, EVENT_HEADER_LEN));
        }
        if type_code > REPORT {
            return Err(Error::Malformed("unknown pattern event type"));
        }
        if size != EVENT_VALUE_LEN {
            return Err(Error::Malformed("pattern event size mismatch"));
        }
        if buf.len() < EVENT_VALUE_LEN {
            return Err(Error::Truncated {
                needed: EVENT_VALUE_LEN,
                available: buf.len(),
            });
        }
        let value = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let event = match type_code {
            SET_RATE_ABS => PatternEvent::SetRateAbs(value),
            SET_CWND_ABS => PatternEvent::SetCwndAbs(value),
            SET_RATE_REL => PatternEvent::SetRateRel(value),
            WAIT_ABS => PatternEvent::WaitAbs(value),
            _ => PatternEvent::WaitRel(value),
        };
        Ok((event, EVENT_VALUE_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_two_bytes() {
        let mut buf = [0u8; 6];
        assert_eq!(PatternEvent::Report.write_to(&mut buf), 2);
        assert_eq!(&buf[..2], &[5, 2]);
    }

    #[test]
    fn valued_event_layout() {
        let mut buf = [0u8; 6];
        assert_eq!(PatternEvent::WaitAbs(0x0102_0304).write_to(&mut buf), 6);
        assert_eq!(buf, [3, 6, 0x04, 0x03, 0x02, 0x01]);
        let (event, len) = PatternEvent::read_from(&buf).unwrap();
        assert_eq!(event, PatternEvent::WaitAbs(0x0102_0304));
        assert_eq!(len, 6);
    }

    #[test]
    fn size_byte_must_match_type() {
        assert!(PatternEvent::read_from(&[5, 6, 0, 0, 0, 0]).is_err());
        assert!(PatternEvent::read_from(&[1, 2]).is_err());
        assert!(PatternEvent::read_from(&[9, 6, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn truncated_value_is_reported() {
        let err = PatternEvent::read_from(&[0, 6, 1]).unwrap_err();
        assert!(matches!(err, Error::Truncated { needed: 6, available: 3 }));
    }
}
