// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wire header of one outgoing message.
//!
//! The header is constructed in place inside a pooled pinned region. It
//! encodes the message length, a flags byte, the sender tag used for
//! completion routing, and either an inline chunk descriptor table or an RMA
//! handle to a pinned chunk-descriptor block. When the body does not
//! piggyback, the header additionally carries the RMA handle of the message
//! region so the receiver can fetch it.
//!
//! Header fields travel little-endian; the body archive carries its own
//! endianness tag.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::byteorder::{
    ByteOrder,
    LittleEndian,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const FLAG_PIGGYBACK_MESSAGE: u8 = 1 << 0;
pub const FLAG_PIGGYBACK_CHUNKS: u8 = 1 << 1;
pub const FLAG_BOOTSTRAP: u8 = 1 << 2;

/// Fixed part of the header: flags, reserved, chunk count, message length,
/// sender tag.
const FIXED_LEN: usize = 16;
/// Encoded size of one chunk descriptor or RMA handle.
const ENTRY_LEN: usize = 24;

const KIND_INLINE: u8 = 0;
const KIND_POINTER: u8 = 1;
const KIND_RMA: u8 = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Remote-access handle: key and address of a pinned region, plus the number
/// of bytes to fetch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RmaHandle {
    pub key: u64,
    pub addr: u64,
    pub len: u32,
}

/// One segment of the serialized payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkDescriptor {
    /// Data travels inside the serialized body.
    Inline { len: u32 },
    /// Zero-copy region registered from user memory; fetched by the receiver.
    Pointer { rma: RmaHandle },
    /// Pre-registered remote region.
    Rma { rma: RmaHandle },
}

/// Decoded form of the wire header.
#[derive(Debug)]
pub struct MessageHeader {
    pub flags: u8,
    /// Sender identity, echoed in the receiver's acknowledgement.
    pub tag: u64,
    pub message_length: u32,
    /// Chunk table; piggybacked in the header when small enough.
    pub chunks: Vec<ChunkDescriptor>,
    /// Where to fetch the chunk table when it does not piggyback.
    pub chunk_block: Option<RmaHandle>,
    /// Where to fetch the body when it does not piggyback.
    pub message_rma: Option<RmaHandle>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MessageHeader {
    pub fn message_piggyback(&self) -> bool {
        self.flags & FLAG_PIGGYBACK_MESSAGE != 0
    }

    pub fn chunks_piggyback(&self) -> bool {
        self.flags & FLAG_PIGGYBACK_CHUNKS != 0
    }

    pub fn bootstrap(&self) -> bool {
        self.flags & FLAG_BOOTSTRAP != 0
    }

    /// Whether the receiver owes the sender an acknowledgement: it does
    /// whenever it has to fetch anything by RDMA.
    pub fn expects_ack(&self) -> bool {
        !self.message_piggyback()
            || self
                .chunks
                .iter()
                .any(|c| matches!(c, ChunkDescriptor::Pointer { .. } | ChunkDescriptor::Rma { .. }))
            || self.chunk_block.is_some()
    }

    /// Size of the encoded header.
    pub fn encoded_len(&self) -> usize {
        let table: usize = if self.chunks_piggyback() {
            self.chunks.len() * ENTRY_LEN
        } else {
            ENTRY_LEN
        };
        let rma: usize = if self.message_piggyback() { 0 } else { ENTRY_LEN };
        FIXED_LEN + table + rma
    }

    /// Encodes the header in place into `out` (the pinned header region).
    /// Returns the number of bytes written.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, Fail> {
        let len: usize = self.encoded_len();
        if out.len() < len {
            let cause: String = format!(
                "header does not fit in region (need={:?}, have={:?})",
                len,
                out.len()
            );
            error!("write(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        out[0] = self.flags;
        out[1] = 0;
        LittleEndian::write_u16(&mut out[2..4], self.chunks.len() as u16);
        LittleEndian::write_u32(&mut out[4..8], self.message_length);
        LittleEndian::write_u64(&mut out[8..16], self.tag);

        let mut pos: usize = FIXED_LEN;
        if self.chunks_piggyback() {
            for chunk in &self.chunks {
                write_entry(&mut out[pos..pos + ENTRY_LEN], chunk);
                pos += ENTRY_LEN;
            }
        } else {
            let block: RmaHandle = match self.chunk_block {
                Some(block) => block,
                None => {
                    let cause: &str = "chunk table does not piggyback and has no block handle";
                    error!("write(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, cause));
                },
            };
            write_rma(&mut out[pos..pos + ENTRY_LEN], KIND_RMA, &block);
            pos += ENTRY_LEN;
        }

        if !self.message_piggyback() {
            let rma: RmaHandle = match self.message_rma {
                Some(rma) => rma,
                None => {
                    let cause: &str = "message does not piggyback and has no RMA handle";
                    error!("write(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, cause));
                },
            };
            write_rma(&mut out[pos..pos + ENTRY_LEN], KIND_RMA, &rma);
            pos += ENTRY_LEN;
        }

        debug_assert_eq!(pos, len);
        Ok(pos)
    }

    /// Decodes a header from the front of `bytes`. Returns the header and its
    /// encoded length.
    pub fn read(bytes: &[u8]) -> Result<(Self, usize), Fail> {
        if bytes.len() < FIXED_LEN {
            let cause: &str = "message is shorter than a header";
            error!("read(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }

        let flags: u8 = bytes[0];
        let num_chunks: usize = LittleEndian::read_u16(&bytes[2..4]) as usize;
        let message_length: u32 = LittleEndian::read_u32(&bytes[4..8]);
        let tag: u64 = LittleEndian::read_u64(&bytes[8..16]);

        let mut header: MessageHeader = MessageHeader {
            flags,
            tag,
            message_length,
            chunks: Vec::new(),
            chunk_block: None,
            message_rma: None,
        };

        let mut pos: usize = FIXED_LEN;
        if header.chunks_piggyback() {
            for _ in 0..num_chunks {
                let entry: ChunkDescriptor = read_entry(take(bytes, pos)?)?;
                header.chunks.push(entry);
                pos += ENTRY_LEN;
            }
        } else {
            let (_, rma): (u8, RmaHandle) = read_rma(take(bytes, pos)?);
            header.chunk_block = Some(rma);
            pos += ENTRY_LEN;
        }

        if !header.message_piggyback() {
            let (_, rma): (u8, RmaHandle) = read_rma(take(bytes, pos)?);
            header.message_rma = Some(rma);
            pos += ENTRY_LEN;
        }

        Ok((header, pos))
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn take(bytes: &[u8], pos: usize) -> Result<&[u8], Fail> {
    if pos + ENTRY_LEN > bytes.len() {
        let cause: &str = "header is truncated";
        error!("take(): {}", cause);
        return Err(Fail::new(libc::EINVAL, cause));
    }
    Ok(&bytes[pos..pos + ENTRY_LEN])
}

fn write_entry(out: &mut [u8], chunk: &ChunkDescriptor) {
    match chunk {
        ChunkDescriptor::Inline { len } => {
            out[0] = KIND_INLINE;
            out[1] = 0;
            out[2] = 0;
            out[3] = 0;
            LittleEndian::write_u32(&mut out[4..8], *len);
            LittleEndian::write_u64(&mut out[8..16], 0);
            LittleEndian::write_u64(&mut out[16..24], 0);
        },
        ChunkDescriptor::Pointer { rma } => write_rma(out, KIND_POINTER, rma),
        ChunkDescriptor::Rma { rma } => write_rma(out, KIND_RMA, rma),
    }
}

fn read_entry(bytes: &[u8]) -> Result<ChunkDescriptor, Fail> {
    match bytes[0] {
        KIND_INLINE => Ok(ChunkDescriptor::Inline {
            len: LittleEndian::read_u32(&bytes[4..8]),
        }),
        KIND_POINTER => {
            let (_, rma): (u8, RmaHandle) = read_rma(bytes);
            Ok(ChunkDescriptor::Pointer { rma })
        },
        KIND_RMA => {
            let (_, rma): (u8, RmaHandle) = read_rma(bytes);
            Ok(ChunkDescriptor::Rma { rma })
        },
        kind => {
            let cause: String = format!("invalid chunk kind (kind={:?})", kind);
            error!("read_entry(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

fn write_rma(out: &mut [u8], kind: u8, rma: &RmaHandle) {
    out[0] = kind;
    out[1] = 0;
    out[2] = 0;
    out[3] = 0;
    LittleEndian::write_u32(&mut out[4..8], rma.len);
    LittleEndian::write_u64(&mut out[8..16], rma.key);
    LittleEndian::write_u64(&mut out[16..24], rma.addr);
}

fn read_rma(bytes: &[u8]) -> (u8, RmaHandle) {
    (
        bytes[0],
        RmaHandle {
            len: LittleEndian::read_u32(&bytes[4..8]),
            key: LittleEndian::read_u64(&bytes[8..16]),
            addr: LittleEndian::read_u64(&bytes[16..24]),
        },
    )
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        ChunkDescriptor,
        MessageHeader,
        RmaHandle,
        FLAG_BOOTSTRAP,
        FLAG_PIGGYBACK_CHUNKS,
        FLAG_PIGGYBACK_MESSAGE,
    };
    use ::anyhow::Result;

    #[test]
    fn round_trip_piggyback() -> Result<()> {
        let header: MessageHeader = MessageHeader {
            flags: FLAG_PIGGYBACK_MESSAGE | FLAG_PIGGYBACK_CHUNKS,
            tag: 77,
            message_length: 123,
            chunks: vec![
                ChunkDescriptor::Inline { len: 16 },
                ChunkDescriptor::Pointer {
                    rma: RmaHandle {
                        key: 5,
                        addr: 0x1000,
                        len: 64,
                    },
                },
            ],
            chunk_block: None,
            message_rma: None,
        };

        let mut region: Vec<u8> = vec![0u8; 4096];
        let written: usize = header.write(&mut region)?;
        crate::ensure_eq!(written, header.encoded_len());

        let (decoded, len): (MessageHeader, usize) = MessageHeader::read(&region)?;
        crate::ensure_eq!(len, written);
        crate::ensure_eq!(decoded.tag, 77);
        crate::ensure_eq!(decoded.message_length, 123);
        crate::ensure_eq!(decoded.chunks, header.chunks);
        crate::ensure_eq!(decoded.message_piggyback(), true);
        crate::ensure_eq!(decoded.expects_ack(), true);
        Ok(())
    }

    #[test]
    fn round_trip_non_piggyback() -> Result<()> {
        let header: MessageHeader = MessageHeader {
            flags: FLAG_PIGGYBACK_CHUNKS | FLAG_BOOTSTRAP,
            tag: 3,
            message_length: 100000,
            chunks: vec![],
            chunk_block: None,
            message_rma: Some(RmaHandle {
                key: 9,
                addr: 0xdead0000,
                len: 100000,
            }),
        };

        let mut region: Vec<u8> = vec![0u8; 4096];
        header.write(&mut region)?;
        let (decoded, _): (MessageHeader, usize) = MessageHeader::read(&region)?;
        crate::ensure_eq!(decoded.message_piggyback(), false);
        crate::ensure_eq!(decoded.bootstrap(), true);
        crate::ensure_eq!(decoded.message_rma, header.message_rma);
        crate::ensure_eq!(decoded.expects_ack(), true);
        Ok(())
    }

    #[test]
    fn plain_piggyback_needs_no_ack() -> Result<()> {
        let header: MessageHeader = MessageHeader {
            flags: FLAG_PIGGYBACK_MESSAGE | FLAG_PIGGYBACK_CHUNKS,
            tag: 1,
            message_length: 8,
            chunks: vec![],
            chunk_block: None,
            message_rma: None,
        };
        crate::ensure_eq!(header.expects_ack(), false);
        Ok(())
    }
}
