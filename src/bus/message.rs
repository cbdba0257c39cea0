//! Wire format of bus messages.
//!
//! Every ring slot starts with a fixed 16-byte little-endian header:
//!
//! | Offset | Size | Field       |
//! |--------|------|-------------|
//! | 0      | 4    | flags       |
//! | 4      | 2    | sequence    |
//! | 6      | 2    | length      |
//! | 8      | 2    | wait slot   |
//! | 10     | 2    | reserved    |
//! | 12     | 4    | result      |
//!
//! followed by `length` bytes of inline payload. Without the `USER` flag the
//! payload is an encoded [`Command`]; with `LONG` it is an [`ExtraRef`]
//! pointing into the sender's extra-buffer pool.

use crate::error::{Error, Result};
use crate::memory::MemBuf;
use std::fmt;
use std::ops::BitOr;

/// Size of the encoded [`Header`].
pub const HEADER_LEN: usize = 16;

/// `wait_slot` value of messages nobody waits for.
pub const NO_WAIT_SLOT: u16 = u16::MAX;

/// Message flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MsgFlags(u32);

impl MsgFlags {
    /// No flags: an internal command.
    pub const NONE: Self = Self(0);
    /// Opaque user payload instead of an internal command.
    pub const USER: Self = Self(1 << 0);
    /// Payload lives in the extra-buffer pool.
    pub const LONG: Self = Self(1 << 1);
    /// Sender is blocked on a wait slot.
    pub const SYNC: Self = Self(1 << 2);

    const ALL: u32 = Self::USER.0 | Self::LONG.0 | Self::SYNC.0;

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Parse raw bits, rejecting unknown ones.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::Malformed(format!("unknown flag bits {bits:#x}")));
        }
        Ok(Self(bits))
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MsgFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload interpretation and sync marker.
    pub flags: MsgFlags,
    /// Per-ring sequence number.
    pub sequence: u16,
    /// Inline payload length.
    pub length: u16,
    /// Wait slot of a synchronous sender, or [`NO_WAIT_SLOT`].
    pub wait_slot: u16,
    /// Result code (0 on success, negative error codes otherwise).
    pub result: i32,
}

impl Header {
    /// Header for a message nobody waits on.
    pub fn new(flags: MsgFlags, length: u16) -> Self {
        Self {
            flags,
            sequence: 0,
            length,
            wait_slot: NO_WAIT_SLOT,
            result: 0,
        }
    }

    /// Encode into the first [`HEADER_LEN`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..10].copy_from_slice(&self.wait_slot.to_le_bytes());
        out[10..12].fill(0);
        out[12..16].copy_from_slice(&self.result.to_le_bytes());
    }

    /// Decode a header, rejecting unknown flags and payloads longer than
    /// `max_payload`.
    pub fn decode(bytes: &[u8], max_payload: usize) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Malformed(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let header = Self {
            flags: MsgFlags::from_bits(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))?,
            sequence: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
            wait_slot: u16::from_le_bytes([bytes[8], bytes[9]]),
            result: i32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        };
        if header.length as usize > max_payload {
            return Err(Error::Malformed(format!(
                "payload length {} exceeds slot size {max_payload}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Whether the sender waits for a reply.
    pub fn is_sync(&self) -> bool {
        self.flags.contains(MsgFlags::SYNC)
    }
}

/// Stage lifecycle requested by a `SetState` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StageState {
    /// Resources allocated, not streaming.
    Inited = 0,
    /// Streaming.
    Started = 1,
    /// Streaming halted.
    Stopped = 2,
    /// Resources released.
    Closed = 3,
}

impl StageState {
    fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(StageState::Inited),
            1 => Ok(StageState::Started),
            2 => Ok(StageState::Stopped),
            3 => Ok(StageState::Closed),
            other => Err(Error::Malformed(format!("unknown stage state {other}"))),
        }
    }
}

/// Internal bus commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Peer registered; the channel is usable.
    Bound,
    /// Peer unbound; further posts fail.
    Unbound,
    /// Switch to another input.
    ChangeInput {
        /// Input index.
        input: u32,
    },
    /// Advertise or request a format on a pad.
    SetFormatCap {
        /// Pad index.
        pad: u32,
        /// Opaque format code.
        format: u32,
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// Lifecycle change.
    SetState(StageState),
    /// Reset the stage's hardware unit.
    ResetControl,
    /// Hardware unit `unit` was programmed with these buffers.
    Schedule {
        /// Logical instance (stream) serviced.
        unit: u32,
        /// Output followed by up to two inputs; unused entries are null.
        buffers: [MemBuf; 3],
    },
    /// A frame was released.
    FrameDone {
        /// Logical instance.
        instance: u32,
        /// Frame sequence number.
        sequence: u64,
        /// Whether the frame was dropped.
        dropped: bool,
    },
}

impl Command {
    const BOUND: u32 = 1;
    const UNBOUND: u32 = 2;
    const CHANGE_INPUT: u32 = 3;
    const SET_FORMAT_CAP: u32 = 4;
    const SET_STATE: u32 = 5;
    const RESET_CONTROL: u32 = 6;
    const SCHEDULE: u32 = 7;
    const FRAME_DONE: u32 = 8;

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Command::Bound | Command::Unbound | Command::ResetControl => 0,
            Command::ChangeInput { .. } | Command::SetState(_) => 4,
            Command::SetFormatCap { .. } => 16,
            Command::Schedule { .. } => 4 + 3 * MemBuf::ENCODED_LEN,
            Command::FrameDone { .. } => 4 + 8 + 4,
        }
    }

    /// Encode into `out`, returning the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(Error::InvalidArgument(format!(
                "command needs {len} bytes, slot has {}",
                out.len()
            )));
        }
        let put = |out: &mut [u8], at: usize, v: u32| out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        match *self {
            Command::Bound => put(out, 0, Self::BOUND),
            Command::Unbound => put(out, 0, Self::UNBOUND),
            Command::ResetControl => put(out, 0, Self::RESET_CONTROL),
            Command::ChangeInput { input } => {
                put(out, 0, Self::CHANGE_INPUT);
                put(out, 4, input);
            }
            Command::SetState(state) => {
                put(out, 0, Self::SET_STATE);
                put(out, 4, state as u32);
            }
            Command::SetFormatCap {
                pad,
                format,
                width,
                height,
            } => {
                put(out, 0, Self::SET_FORMAT_CAP);
                put(out, 4, pad);
                put(out, 8, format);
                put(out, 12, width);
                put(out, 16, height);
            }
            Command::Schedule { unit, buffers } => {
                put(out, 0, Self::SCHEDULE);
                put(out, 4, unit);
                for (i, buf) in buffers.iter().enumerate() {
                    let at = 8 + i * MemBuf::ENCODED_LEN;
                    buf.encode(&mut out[at..at + MemBuf::ENCODED_LEN]);
                }
            }
            Command::FrameDone {
                instance,
                sequence,
                dropped,
            } => {
                put(out, 0, Self::FRAME_DONE);
                put(out, 4, instance);
                out[8..16].copy_from_slice(&sequence.to_le_bytes());
                put(out, 16, dropped as u32);
            }
        }
        Ok(len)
    }

    /// Decode a command payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let word = |at: usize| -> Result<u32> {
            bytes
                .get(at..at + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| Error::Malformed(format!("command truncated at byte {at}")))
        };
        let cmd = match word(0)? {
            Self::BOUND => Command::Bound,
            Self::UNBOUND => Command::Unbound,
            Self::RESET_CONTROL => Command::ResetControl,
            Self::CHANGE_INPUT => Command::ChangeInput { input: word(4)? },
            Self::SET_STATE => Command::SetState(StageState::from_u32(word(4)?)?),
            Self::SET_FORMAT_CAP => Command::SetFormatCap {
                pad: word(4)?,
                format: word(8)?,
                width: word(12)?,
                height: word(16)?,
            },
            Self::SCHEDULE => {
                let unit = word(4)?;
                let mut buffers = [MemBuf::default(); 3];
                for (i, buf) in buffers.iter_mut().enumerate() {
                    let at = 8 + i * MemBuf::ENCODED_LEN;
                    *buf = MemBuf::decode(bytes.get(at..).unwrap_or_default())?;
                }
                Command::Schedule { unit, buffers }
            }
            Self::FRAME_DONE => {
                let lo = word(8)? as u64;
                let hi = word(12)? as u64;
                Command::FrameDone {
                    instance: word(4)?,
                    sequence: lo | (hi << 32),
                    dropped: word(16)? != 0,
                }
            }
            other => return Err(Error::Malformed(format!("unknown opcode {other}"))),
        };
        Ok(cmd)
    }
}

/// Reference to a payload in the sender's extra-buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraRef {
    /// Pool slot index.
    pub slot: u16,
    /// Payload length in bytes.
    pub len: u32,
    /// Memory of the slot.
    pub mem: MemBuf,
}

impl ExtraRef {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 8 + MemBuf::ENCODED_LEN;

    /// Encode into `out`.
    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.slot.to_le_bytes());
        out[2..4].fill(0);
        out[4..8].copy_from_slice(&self.len.to_le_bytes());
        self.mem.encode(&mut out[8..8 + MemBuf::ENCODED_LEN]);
    }

    /// Decode from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::Malformed("extra reference truncated".into()));
        }
        Ok(Self {
            slot: u16::from_le_bytes([bytes[0], bytes[1]]),
            len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            mem: MemBuf::decode(&bytes[8..])?,
        })
    }
}

/// Something to post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// Internal command.
    Command(Command),
    /// Opaque bytes, delivered with the `USER` flag.
    User(&'a [u8]),
}

impl Payload<'_> {
    pub(crate) fn flags(&self) -> MsgFlags {
        match self {
            Payload::Command(_) => MsgFlags::NONE,
            Payload::User(_) => MsgFlags::USER,
        }
    }

    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Payload::Command(cmd) => cmd.encoded_len(),
            Payload::User(bytes) => bytes.len(),
        }
    }

    pub(crate) fn encode(&self, out: &mut [u8]) -> Result<usize> {
        match self {
            Payload::Command(cmd) => cmd.encode(out),
            Payload::User(bytes) => {
                let dst = out.get_mut(..bytes.len()).ok_or_else(|| {
                    Error::InvalidArgument(format!("{} byte payload exceeds slot", bytes.len()))
                })?;
                dst.copy_from_slice(bytes);
                Ok(bytes.len())
            }
        }
    }
}

impl From<Command> for Payload<'_> {
    fn from(cmd: Command) -> Self {
        Payload::Command(cmd)
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Payload::User(bytes)
    }
}

/// Decoded body of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body<'a> {
    /// Internal command.
    Command(Command),
    /// Inline user payload.
    User(&'a [u8]),
    /// User payload carried in the sender's extra-buffer pool.
    Long(&'a [u8]),
}

/// A received message as seen by a [`BusHandler`].
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    /// Wire header.
    pub header: Header,
    /// Decoded body.
    pub body: Body<'a>,
}

impl Message<'_> {
    /// The command, if this is an internal command message.
    pub fn command(&self) -> Option<Command> {
        match self.body {
            Body::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// User payload bytes (inline or long).
    pub fn user_data(&self) -> Option<&[u8]> {
        match self.body {
            Body::User(bytes) | Body::Long(bytes) => Some(bytes),
            Body::Command(_) => None,
        }
    }
}

/// Reply payload written by a handler for a synchronous sender.
pub struct ReplyWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ReplyWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Append reply bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the reply would exceed the sender's
    /// slot size. Nothing is written in that case.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.len + bytes.len();
        let cap = self.buf.len();
        let dst = self.buf.get_mut(self.len..end).ok_or_else(|| {
            Error::InvalidArgument(format!("reply of {end} bytes exceeds {cap}"))
        })?;
        dst.copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Maximum reply size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl fmt::Debug for ReplyWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyWriter")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// Receives messages delivered to an endpoint.
///
/// The returned value becomes the `result` seen by a synchronous sender.
pub trait BusHandler: Send {
    /// Handle one message.
    fn on_message(&mut self, msg: &Message<'_>, reply: &mut ReplyWriter<'_>) -> i32;
}

impl<F> BusHandler for F
where
    F: FnMut(&Message<'_>, &mut ReplyWriter<'_>) -> i32 + Send,
{
    fn on_message(&mut self, msg: &Message<'_>, reply: &mut ReplyWriter<'_>) -> i32 {
        self(msg, reply)
    }
}
