//! # Exception Message Wire Format
//!
//! Encoding and decoding of the `mach_exc` MIG messages exchanged on the
//! exception port. With `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES` the kernel
//! sends `mach_exception_raise` (id 2405) and expects a reply with id 2505.
//!
//! ## Request layout (`__Request__mach_exception_raise_t`, `#pragma pack(4)`)
//!
//! | offset | field                                 |
//! |--------|---------------------------------------|
//! | 0      | `mach_msg_header_t` (24 bytes)        |
//! | 24     | descriptor count                      |
//! | 28     | thread port descriptor (12 bytes)     |
//! | 40     | task port descriptor (12 bytes)       |
//! | 52     | `NDR_record_t` (8 bytes)              |
//! | 60     | `exception_type_t exception`          |
//! | 64     | `mach_msg_type_number_t codeCnt`      |
//! | 68     | `int64_t code[2]`                     |
//!
//! ## Reply layout (`__Reply__mach_exception_raise_t`)
//!
//! Header (24 bytes), NDR record (8 bytes), `kern_return_t RetCode`.
//!
//! All fields are host-endian; Mach messages never leave the machine.

use thiserror::Error;

use crate::kern_return::KernReturn;
use crate::kernel::{PortName, PORT_NULL};

pub const MACH_EXCEPTION_RAISE: i32 = 2405;
pub const MACH_EXCEPTION_RAISE_STATE: i32 = 2406;
pub const MACH_EXCEPTION_RAISE_STATE_IDENTITY: i32 = 2407;

/// Reply ids are the request id plus this offset.
pub const REPLY_ID_OFFSET: i32 = 100;

pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001f;

pub const MACH_MSG_TYPE_MOVE_SEND: u8 = 17;
pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: u8 = 18;
pub const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;

pub const HEADER_SIZE: usize = 24;
pub const REQUEST_SIZE: usize = 84;
pub const REPLY_SIZE: usize = 36;
const DESCRIPTOR_SIZE: usize = 12;
const BODY_OFFSET: usize = HEADER_SIZE;
const DESCRIPTORS_OFFSET: usize = BODY_OFFSET + 4;
const NDR_OFFSET: usize = DESCRIPTORS_OFFSET + 2 * DESCRIPTOR_SIZE;

/// `NDR_record` for a little-endian host: `int_rep = 1`, everything else zero.
pub const NDR_RECORD: [u8; 8] = [0, 0, 0, 0, 1, 0, 0, 0];

/// A message could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError
{
    #[error("message truncated: need {needed} bytes, got {available}")]
    Truncated
    {
        needed: usize, available: usize
    },

    #[error("expected {expected} port descriptors, found {found}")]
    DescriptorCount
    {
        expected: u32, found: u32
    },
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DecodeError>
{
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .ok_or(DecodeError::Truncated {
            needed: offset + 4,
            available: bytes.len(),
        })
}

fn read_i32(bytes: &[u8], offset: usize) -> Result<i32, DecodeError>
{
    read_u32(bytes, offset).map(|v| i32::from_ne_bytes(v.to_ne_bytes()))
}

fn read_i64(bytes: &[u8], offset: usize) -> Result<i64, DecodeError>
{
    bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_ne_bytes)
        .ok_or(DecodeError::Truncated {
            needed: offset + 8,
            available: bytes.len(),
        })
}

fn put(out: &mut [u8], offset: usize, bytes: &[u8])
{
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// `mach_msg_header_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader
{
    pub bits: u32,
    pub size: u32,
    pub remote_port: PortName,
    pub local_port: PortName,
    pub voucher_port: PortName,
    pub id: i32,
}

impl MessageHeader
{
    /// Parse the header at the start of `bytes`.
    ///
    /// ## Errors
    ///
    /// [`DecodeError::Truncated`] when fewer than 24 bytes are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError>
    {
        Ok(Self {
            bits: read_u32(bytes, 0)?,
            size: read_u32(bytes, 4)?,
            remote_port: read_u32(bytes, 8)?,
            local_port: read_u32(bytes, 12)?,
            voucher_port: read_u32(bytes, 16)?,
            id: read_i32(bytes, 20)?,
        })
    }

    /// Write the header into the first 24 bytes of `out`.
    ///
    /// ## Panics
    ///
    /// Panics if `out` is shorter than [`HEADER_SIZE`].
    pub fn encode(&self, out: &mut [u8])
    {
        put(out, 0, &self.bits.to_ne_bytes());
        put(out, 4, &self.size.to_ne_bytes());
        put(out, 8, &self.remote_port.to_ne_bytes());
        put(out, 12, &self.local_port.to_ne_bytes());
        put(out, 16, &self.voucher_port.to_ne_bytes());
        put(out, 20, &self.id.to_ne_bytes());
    }

    #[must_use]
    pub const fn is_complex(&self) -> bool
    {
        self.bits & MACH_MSGH_BITS_COMPLEX != 0
    }

    /// `MACH_MSGH_BITS_REMOTE(bits)`: disposition of the reply right.
    #[must_use]
    pub const fn remote_disposition(&self) -> u32
    {
        self.bits & MACH_MSGH_BITS_REMOTE_MASK
    }
}

/// `mach_msg_port_descriptor_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortDescriptor
{
    pub name: PortName,
    pub disposition: u8,
    pub kind: u8,
}

impl PortDescriptor
{
    fn decode(bytes: &[u8], offset: usize) -> Result<Self, DecodeError>
    {
        let name = read_u32(bytes, offset)?;
        let tail = read_u32(bytes, offset + 8)?.to_ne_bytes();
        Ok(Self {
            name,
            disposition: tail[2],
            kind: tail[3],
        })
    }

    fn encode(&self, out: &mut [u8], offset: usize)
    {
        put(out, offset, &self.name.to_ne_bytes());
        put(out, offset + 4, &[0; 6]);
        put(out, offset + 10, &[self.disposition, self.kind]);
    }
}

/// Port rights carried by a complex message.
///
/// Used to release rights from messages that are rejected without being
/// handled. Non-port descriptors and anything past the received bytes are
/// skipped.
#[must_use]
pub fn carried_ports(header: &MessageHeader, bytes: &[u8]) -> Vec<PortName>
{
    if !header.is_complex() {
        return Vec::new();
    }
    let Ok(count) = read_u32(bytes, BODY_OFFSET) else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    for index in 0..count as usize {
        let offset = DESCRIPTORS_OFFSET + index * DESCRIPTOR_SIZE;
        let Ok(descriptor) = PortDescriptor::decode(bytes, offset) else {
            break;
        };
        if descriptor.kind == MACH_MSG_PORT_DESCRIPTOR && descriptor.name != PORT_NULL {
            ports.push(descriptor.name);
        }
    }
    ports
}

/// Body of `mach_exception_raise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRequest
{
    pub header: MessageHeader,
    pub thread: PortName,
    pub task: PortName,
    pub exception: i32,
    pub codes: [i64; 2],
}

impl ExceptionRequest
{
    /// ## Errors
    ///
    /// - [`DecodeError::Truncated`]: fewer bytes than the fixed layout needs
    /// - [`DecodeError::DescriptorCount`]: not exactly two port descriptors
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError>
    {
        let header = MessageHeader::decode(bytes)?;
        let count = read_u32(bytes, BODY_OFFSET)?;
        if count != 2 {
            return Err(DecodeError::DescriptorCount { expected: 2, found: count });
        }
        let thread = PortDescriptor::decode(bytes, DESCRIPTORS_OFFSET)?;
        let task = PortDescriptor::decode(bytes, DESCRIPTORS_OFFSET + DESCRIPTOR_SIZE)?;
        let exception = read_i32(bytes, NDR_OFFSET + 8)?;
        let code_count = read_u32(bytes, NDR_OFFSET + 12)?;
        let mut codes = [0_i64; 2];
        for (index, code) in codes.iter_mut().enumerate().take(code_count.min(2) as usize) {
            *code = read_i64(bytes, NDR_OFFSET + 16 + index * 8)?;
        }
        Ok(Self {
            header,
            thread: thread.name,
            task: task.name,
            exception,
            codes,
        })
    }

    /// Build the request the kernel would send for an exception on `thread`.
    #[must_use]
    pub fn new(exception_port: PortName, reply_port: PortName, thread: PortName, task: PortName) -> Self
    {
        Self {
            header: MessageHeader {
                bits: MACH_MSGH_BITS_COMPLEX | u32::from(MACH_MSG_TYPE_MOVE_SEND_ONCE),
                size: REQUEST_SIZE as u32,
                remote_port: reply_port,
                local_port: exception_port,
                voucher_port: PORT_NULL,
                id: MACH_EXCEPTION_RAISE,
            },
            thread,
            task,
            exception: 0,
            codes: [0; 2],
        }
    }

    /// Encode into `out`, returning the byte length.
    ///
    /// ## Panics
    ///
    /// Panics if `out` is shorter than [`REQUEST_SIZE`].
    pub fn encode(&self, out: &mut [u8]) -> usize
    {
        self.header.encode(out);
        put(out, BODY_OFFSET, &2_u32.to_ne_bytes());
        let descriptor = |name| PortDescriptor {
            name,
            disposition: MACH_MSG_TYPE_MOVE_SEND,
            kind: MACH_MSG_PORT_DESCRIPTOR,
        };
        descriptor(self.thread).encode(out, DESCRIPTORS_OFFSET);
        descriptor(self.task).encode(out, DESCRIPTORS_OFFSET + DESCRIPTOR_SIZE);
        put(out, NDR_OFFSET, &NDR_RECORD);
        put(out, NDR_OFFSET + 8, &self.exception.to_ne_bytes());
        put(out, NDR_OFFSET + 12, &2_u32.to_ne_bytes());
        put(out, NDR_OFFSET + 16, &self.codes[0].to_ne_bytes());
        put(out, NDR_OFFSET + 24, &self.codes[1].to_ne_bytes());
        REQUEST_SIZE
    }
}

/// `__Reply__mach_exception_raise_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionReply
{
    pub header: MessageHeader,
    pub ret_code: KernReturn,
}

impl ExceptionReply
{
    /// Reply to `request` carrying `ret_code`.
    ///
    /// Goes to the request's reply port, moving the right the kernel sent.
    #[must_use]
    pub fn to(request: &MessageHeader, ret_code: KernReturn) -> Self
    {
        Self {
            header: MessageHeader {
                bits: request.remote_disposition(),
                size: REPLY_SIZE as u32,
                remote_port: request.remote_port,
                local_port: PORT_NULL,
                voucher_port: PORT_NULL,
                id: request.id.wrapping_add(REPLY_ID_OFFSET),
            },
            ret_code,
        }
    }

    /// ## Panics
    ///
    /// Panics if `out` is shorter than [`REPLY_SIZE`].
    pub fn encode(&self, out: &mut [u8]) -> usize
    {
        self.header.encode(out);
        put(out, HEADER_SIZE, &NDR_RECORD);
        put(out, HEADER_SIZE + 8, &self.ret_code.to_ne_bytes());
        REPLY_SIZE
    }

    /// ## Errors
    ///
    /// [`DecodeError::Truncated`] when fewer than 36 bytes are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError>
    {
        Ok(Self {
            header: MessageHeader::decode(bytes)?,
            ret_code: read_i32(bytes, HEADER_SIZE + 8)?,
        })
    }
}
