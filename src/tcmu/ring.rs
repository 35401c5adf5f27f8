// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Typed access to the TCMU mailbox and command ring.
//!
//! The kernel maps a shared region whose head is a mailbox (ring geometry
//! plus the producer/consumer offsets) followed by the command ring body.
//! All multi-byte fields are little-endian; `cmd_head` is written by the
//! kernel and only read here, `cmd_tail` is ours and advances only once a
//! response occupies the slot it covers. Entries are 8-byte aligned and
//! never wrap the ring end (the kernel emits a PAD entry instead), so every
//! entry is contiguous in the region.

use std::sync::Arc;

use num_enum::TryFromPrimitive;
use vm_memory::{mmap::MmapRegion, ByteValued, Bytes, Le16, Le32, Le64, VolatileMemory};

use crate::{
    scsi::{ScsiCmd, ScsiResponse, SAM_STAT_GOOD},
    tcmu::{Error, Result},
};

pub const SENSE_BUFFER_SIZE: usize = 96;

// Mailbox field offsets.
const MB_VERSION: usize = 0;
const MB_FLAGS: usize = 2;
const MB_CMDR_OFF: usize = 4;
const MB_CMDR_SIZE: usize = 8;
const MB_CMD_HEAD: usize = 12;
const MB_CMD_TAIL: usize = 64;

// Entry header: len_op, cmd_id, kflags, uflags.
const ENT_LEN_OP: usize = 0;
const ENT_CMD_ID: usize = 4;

// Request body. The CDB offset and every IOV base are absolute offsets into
// the shared region, not entry-relative.
const ENT_REQ_IOV_CNT: usize = 8;
const ENT_REQ_CDB_OFF: usize = 20;
const ENT_REQ_IOV0: usize = 52; // past the three reserved words
const IOV_SIZE: usize = 16;

// Response body, overlaying the request on reply.
const ENT_RSP_STATUS: usize = 8;
const ENT_RSP_SENSE: usize = 16;

/// Low three bits of `len_op`. Anything else is a protocol error.
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u32)]
pub enum EntryOp {
    Pad = 0,
    Cmd = 1,
}

/// Derive the CDB length from its operation code (SPC-4 4.2.5.1). For the
/// variable-length form (0x7f) byte 7 carries the additional length.
pub fn cdb_length(cdb: &[u8]) -> Result<usize> {
    let opcode = *cdb.first().ok_or(Error::Geometry)?;
    match opcode {
        0x00..=0x1f => Ok(6),
        0x20..=0x5f => Ok(10),
        0x7f => cdb
            .get(7)
            .map(|&extra| usize::from(extra) + 8)
            .ok_or(Error::Geometry),
        0x80..=0x9f => Ok(16),
        0xa0..=0xbf => Ok(12),
        _ => Err(Error::UnsupportedOpcode(opcode)),
    }
}

/// The mailbox and ring of one TCMU device.
pub struct Ring {
    region: Arc<MmapRegion>,
}

impl Ring {
    pub fn new(region: Arc<MmapRegion>) -> Result<Self> {
        let ring = Self { region };
        let off = ring.mb_cmdr_offset()? as usize;
        let size = ring.mb_cmdr_size()? as usize;
        if size == 0 || off.checked_add(size).map_or(true, |end| end > ring.region.size()) {
            return Err(Error::Geometry);
        }
        Ok(ring)
    }

    pub fn region(&self) -> &Arc<MmapRegion> {
        &self.region
    }

    fn read<T: ByteValued>(&self, off: usize) -> Result<T> {
        Ok(self.region.as_volatile_slice().read_obj(off)?)
    }

    fn write<T: ByteValued>(&self, val: T, off: usize) -> Result<()> {
        self.region.as_volatile_slice().write_obj(val, off)?;
        Ok(())
    }

    pub fn mb_version(&self) -> Result<u16> {
        Ok(self.read::<Le16>(MB_VERSION)?.to_native())
    }

    pub fn mb_flags(&self) -> Result<u16> {
        Ok(self.read::<Le16>(MB_FLAGS)?.to_native())
    }

    pub fn mb_cmdr_offset(&self) -> Result<u32> {
        Ok(self.read::<Le32>(MB_CMDR_OFF)?.to_native())
    }

    pub fn mb_cmdr_size(&self) -> Result<u32> {
        Ok(self.read::<Le32>(MB_CMDR_SIZE)?.to_native())
    }

    pub fn mb_cmd_head(&self) -> Result<u32> {
        Ok(self.read::<Le32>(MB_CMD_HEAD)?.to_native())
    }

    pub fn mb_cmd_tail(&self) -> Result<u32> {
        Ok(self.read::<Le32>(MB_CMD_TAIL)?.to_native())
    }

    pub fn mb_set_tail(&self, tail: u32) -> Result<()> {
        self.write(Le32::from(tail), MB_CMD_TAIL)
    }

    fn len_op(&self, off: usize) -> Result<u32> {
        Ok(self.read::<Le32>(off + ENT_LEN_OP)?.to_native())
    }

    pub fn entry_opcode(&self, off: usize) -> Result<EntryOp> {
        let op = self.len_op(off)? & 0x7;
        EntryOp::try_from(op).map_err(|_| Error::Protocol(op))
    }

    pub fn entry_length(&self, off: usize) -> Result<u32> {
        Ok(self.len_op(off)? & !0x7)
    }

    pub fn entry_cmd_id(&self, off: usize) -> Result<u16> {
        Ok(self.read::<Le16>(off + ENT_CMD_ID)?.to_native())
    }

    pub fn entry_set_cmd_id(&self, off: usize, id: u16) -> Result<()> {
        self.write(Le16::from(id), off + ENT_CMD_ID)
    }

    pub fn entry_iov_count(&self, off: usize) -> Result<u32> {
        Ok(self.read::<Le32>(off + ENT_REQ_IOV_CNT)?.to_native())
    }

    pub fn entry_cdb_offset(&self, off: usize) -> Result<u64> {
        Ok(self.read::<Le64>(off + ENT_REQ_CDB_OFF)?.to_native())
    }

    /// The i-th scatter/gather element as `(offset, length)` into the shared
    /// region, bounds-checked against it.
    pub fn entry_iov(&self, off: usize, i: usize) -> Result<(usize, usize)> {
        let iov = off + ENT_REQ_IOV0 + i * IOV_SIZE;
        let base = self.read::<Le64>(iov)?.to_native() as usize;
        let len = self.read::<Le64>(iov + 8)?.to_native() as usize;
        if base.checked_add(len).map_or(true, |end| end > self.region.size()) {
            return Err(Error::Geometry);
        }
        Ok((base, len))
    }

    /// Copy the entry's CDB out of the region, sized by its opcode.
    pub fn entry_cdb(&self, off: usize) -> Result<Vec<u8>> {
        let start = self.entry_cdb_offset(off)? as usize;
        let avail = self.region.size().checked_sub(start).ok_or(Error::Geometry)?;
        let mut peek = [0u8; 8];
        let peek_len = avail.min(peek.len());
        self.region
            .as_volatile_slice()
            .read_slice(&mut peek[..peek_len], start)?;
        let len = cdb_length(&peek[..peek_len])?;
        if len > avail {
            return Err(Error::Geometry);
        }
        let mut cdb = vec![0u8; len];
        self.region.as_volatile_slice().read_slice(&mut cdb, start)?;
        Ok(cdb)
    }

    /// Write a response into the slot at `off`: SAM status, and on anything
    /// but GOOD the sense data, zero-padded to the full 96-byte buffer.
    pub fn set_response(&self, off: usize, resp: &ScsiResponse) -> Result<()> {
        self.write(resp.status(), off + ENT_RSP_STATUS)?;
        if resp.status() != SAM_STAT_GOOD {
            let mut sense = [0u8; SENSE_BUFFER_SIZE];
            let n = resp.sense().len().min(SENSE_BUFFER_SIZE);
            sense[..n].copy_from_slice(&resp.sense()[..n]);
            self.region
                .as_volatile_slice()
                .write_slice(&sense, off + ENT_RSP_SENSE)?;
        }
        Ok(())
    }

    /// Pop the next command between the caller's cached tail and the
    /// kernel's head, skipping PAD entries. The cached tail is advanced past
    /// everything consumed; the on-mailbox tail is left alone until the
    /// response is posted.
    pub fn pop_command(&self, cached_tail: &mut u32) -> Result<Option<ScsiCmd>> {
        let cmdr_off = self.mb_cmdr_offset()?;
        let cmdr_size = self.mb_cmdr_size()?;
        loop {
            if *cached_tail == self.mb_cmd_head()? {
                return Ok(None);
            }
            let off = (cmdr_off + *cached_tail) as usize;
            let len = self.entry_length(off)?;
            if len == 0 {
                return Err(Error::Geometry);
            }
            match self.entry_opcode(off)? {
                EntryOp::Pad => {
                    *cached_tail = (*cached_tail + len) % cmdr_size;
                }
                EntryOp::Cmd => {
                    let id = self.entry_cmd_id(off)?;
                    let cdb = self.entry_cdb(off)?;
                    let iov_cnt = self.entry_iov_count(off)? as usize;
                    let mut iovs = Vec::with_capacity(iov_cnt);
                    for i in 0..iov_cnt {
                        iovs.push(self.entry_iov(off, i)?);
                    }
                    *cached_tail = (*cached_tail + len) % cmdr_size;
                    return Ok(Some(ScsiCmd::new(id, cdb, Arc::clone(&self.region), iovs)));
                }
            }
        }
    }

    /// Post a response at the on-mailbox tail: skip any remaining PAD
    /// entries (advancing the tail over them), make the slot's `cmd_id`
    /// match the response, write status and sense, and advance the tail
    /// past the slot. The ring is strictly FIFO, so the id rewrite is a
    /// no-op in practice.
    pub fn post_response(&self, resp: &ScsiResponse) -> Result<()> {
        let cmdr_off = self.mb_cmdr_offset()?;
        let cmdr_size = self.mb_cmdr_size()?;
        let mut tail = self.mb_cmd_tail()?;
        let mut off = (cmdr_off + tail) as usize;
        while self.entry_opcode(off)? != EntryOp::Cmd {
            let len = self.entry_length(off)?;
            if len == 0 {
                return Err(Error::Geometry);
            }
            tail = (tail + len) % cmdr_size;
            self.mb_set_tail(tail)?;
            off = (cmdr_off + tail) as usize;
        }
        if self.entry_cmd_id(off)? != resp.id() {
            self.entry_set_cmd_id(off, resp.id())?;
        }
        self.set_response(off, resp)?;
        self.mb_set_tail((tail + self.entry_length(off)?) % cmdr_size)
    }
}
