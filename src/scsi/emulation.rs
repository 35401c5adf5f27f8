// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The default SPC/SBC emulator over a positional-I/O backend.
//!
//! Enough of the command set to make a TCMU loop LUN usable: INQUIRY
//! (standard page and VPD 0x00/0x83/0xB0), TEST UNIT READY, READ and WRITE
//! in the 6/10/12/16-byte forms, READ CAPACITY(16), and the caching mode
//! page via MODE SENSE/MODE SELECT.

use std::{
    fs,
    io::{self, Read, Write},
    mem,
    path::PathBuf,
};

use log::{debug, error, warn};

use crate::scsi::{
    opcodes, sense, BlockBackend, DataSizes, InquiryInfo, ScsiCmd, ScsiCmdHandler, ScsiResponse,
};

/// Pad or truncate `s` to exactly `len` bytes, space-filled.
fn fixed_string(s: &str, len: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.resize(len, b' ');
    out
}

/// The caching mode page (page code 0x08), 20 bytes.
fn caching_mode_page(out: &mut Vec<u8>, wce: bool) {
    let mut page = [0u8; 20];
    page[0] = 0x08; // caching mode page
    page[1] = 0x12; // page length
    if wce {
        page[2] |= 0x04; // WCE
    }
    out.extend_from_slice(&page);
}

/// A LUN emulated on top of a [`BlockBackend`].
///
/// Carries everything the command set needs to know about the device it
/// fronts: geometry, the configfs dev-config string (VPD 0x83), the configfs
/// attribute directory (VPD 0xB0), inquiry identity and the write-cache flag.
pub struct EmulatedLun {
    backend: Box<dyn BlockBackend>,
    inquiry: InquiryInfo,
    sizes: DataSizes,
    dev_config: String,
    attrib_dir: PathBuf,
    write_cache: bool,
}

impl EmulatedLun {
    pub fn new(
        backend: Box<dyn BlockBackend>,
        inquiry: InquiryInfo,
        sizes: DataSizes,
        dev_config: String,
        attrib_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            inquiry,
            sizes,
            dev_config,
            attrib_dir,
            write_cache: false,
        }
    }

    pub fn set_write_cache(&mut self, wce: bool) {
        self.write_cache = wce;
    }

    /// A numeric attribute of the backing TCMU core device, e.g.
    /// `hw_block_size` or `hw_max_sectors`.
    fn device_attr(&self, name: &str) -> io::Result<u64> {
        let raw = fs::read_to_string(self.attrib_dir.join(name))?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn inquiry(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        if cmd.cdb()[1] & 0x01 == 0 {
            if cmd.cdb()[2] == 0x00 {
                return self.std_inquiry(cmd);
            }
            // page code without EVPD
            return Ok(cmd.illegal_request());
        }
        self.evpd_inquiry(cmd)
    }

    fn std_inquiry(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let mut buf = [0u8; 36];
        buf[2] = 0x05; // SPC-3
        buf[3] = 0x02; // response data format
        buf[4] = 31; // additional length
        buf[7] = 0x02; // CmdQue

        buf[8..16].copy_from_slice(&fixed_string(&self.inquiry.vendor_id, 8));
        buf[16..32].copy_from_slice(&fixed_string(&self.inquiry.product_id, 16));
        buf[32..36].copy_from_slice(&fixed_string(&self.inquiry.product_rev, 4));

        cmd.data_in().write_all(&buf)?;
        Ok(cmd.ok())
    }

    fn evpd_inquiry(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        match cmd.cdb()[2] {
            // Supported VPD pages: the absolute minimum.
            0x00 => {
                let mut data = [0u8; 6];
                data[3] = 2;
                data[4] = 0x00;
                data[5] = 0x83;
                cmd.data_in().write_all(&data)?;
                Ok(cmd.ok())
            }
            0x83 => self.device_identification(cmd),
            0xb0 => self.block_limits(cmd),
            _ => Ok(cmd.illegal_request()),
        }
    }

    /// VPD page 0x83, device identification: a T10 vendor-id descriptor, an
    /// NAA descriptor and a vendor-specific descriptor carrying the configfs
    /// dev-config string.
    fn device_identification(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let mut data = vec![0u8; 512];
        data[1] = 0x83;
        let mut used = 4;

        // 1/3: T10 vendor id (ASCII, id type 1)
        data[used] = 2;
        data[used + 1] = 1;
        data[used + 3] = 9;
        data[used + 4..used + 12].copy_from_slice(&fixed_string(&self.inquiry.vendor_id, 8));
        used += 9 + 4;

        // 2/3: NAA (binary, id type 3), registered extended format
        data[used] = 1;
        data[used + 1] = 3;
        data[used + 3] = 16;
        data[used + 4..used + 8].copy_from_slice(&[0x60, 0x01, 0x40, 0x50]);
        used += 20;

        // 3/3: vendor specific (ASCII, id type 0) - the dev-config string
        let cfg = self.dev_config.as_bytes();
        data[used] = 2;
        data[used + 1] = 0;
        data[used + 3] = cfg.len() as u8 + 1;
        data[used + 4..used + 4 + cfg.len()].copy_from_slice(cfg);
        used += cfg.len() + 1 + 4;

        let page_len = (used - 4) as u16;
        data[2..4].copy_from_slice(&page_len.to_be_bytes());

        cmd.data_in().write_all(&data[..used])?;
        Ok(cmd.ok())
    }

    /// VPD page 0xB0, block limits, sized from the core device's
    /// `hw_block_size` and `hw_max_sectors` attributes.
    fn block_limits(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let mut data = [0u8; 64];
        data[1] = 0xb0;
        data[2..4].copy_from_slice(&0x3c_u16.to_be_bytes());

        let (block_size, max_sectors) = match (
            self.device_attr("hw_block_size"),
            self.device_attr("hw_max_sectors"),
        ) {
            (Ok(bs), Ok(ms)) => (bs, ms),
            (Err(e), _) | (_, Err(e)) => {
                warn!("block limits: cannot read device attributes: {e}");
                return Ok(cmd.illegal_request());
            }
        };
        let sectors_per_block = block_size / 512;
        if sectors_per_block == 0 {
            return Ok(cmd.illegal_request());
        }
        let max_xfer_length = (max_sectors / sectors_per_block) as u32;
        data[8..12].copy_from_slice(&max_xfer_length.to_be_bytes());
        data[12..16].copy_from_slice(&max_xfer_length.to_be_bytes());

        cmd.data_in().write_all(&data)?;
        Ok(cmd.ok())
    }

    fn service_action_in(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        match cmd.cdb()[1] & 0x1f {
            opcodes::SA_READ_CAPACITY_16 => self.read_capacity_16(cmd),
            _ => Ok(cmd.not_handled()),
        }
    }

    fn read_capacity_16(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let mut buf = [0u8; 32];
        // "index of the last LBA", so minus one
        let last_lba = self.sizes.volume_size / u64::from(self.sizes.sector_size) - 1;
        buf[0..8].copy_from_slice(&last_lba.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sizes.sector_size.to_be_bytes());
        cmd.data_in().write_all(&buf)?;
        Ok(cmd.ok())
    }

    fn read(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let sector = u64::from(self.sizes.sector_size);
        let offset = cmd.lba() * sector;
        let length = cmd.transfer_length() as usize * sector as usize;

        let mut buf = mem::take(&mut cmd.buffer);
        buf.clear();
        buf.resize(length, 0);

        let resp = match self.backend.read_at(&mut buf, offset) {
            Ok(n) if n < length => {
                error!("short read from backend: {n} of {length} bytes");
                cmd.medium_error()
            }
            Err(e) => {
                error!("backend read failed: {e}");
                cmd.medium_error()
            }
            Ok(_) => match cmd.data_in().write_all(&buf) {
                Ok(()) => cmd.ok(),
                Err(e) => {
                    error!("copying read data to the kernel buffer failed: {e}");
                    cmd.medium_error()
                }
            },
        };
        cmd.buffer = buf;
        Ok(resp)
    }

    fn write(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let sector = u64::from(self.sizes.sector_size);
        let offset = cmd.lba() * sector;
        let length = cmd.transfer_length() as usize * sector as usize;

        let mut buf = mem::take(&mut cmd.buffer);
        buf.clear();
        buf.resize(length, 0);

        let resp = match cmd.data_out().read_exact(&mut buf) {
            Err(e) => {
                error!("copying write data from the kernel buffer failed: {e}");
                cmd.medium_error()
            }
            Ok(()) => match self.backend.write_at(&buf, offset) {
                Ok(n) if n < length => {
                    error!("short write to backend: {n} of {length} bytes");
                    cmd.medium_error()
                }
                Err(e) => {
                    error!("backend write failed: {e}");
                    cmd.medium_error()
                }
                Ok(_) => cmd.ok(),
            },
        };
        cmd.buffer = buf;
        Ok(resp)
    }

    fn mode_sense(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let alloc = cmd.allocation_length() as usize;
        let page = cmd.cdb()[2];

        let mut pages = Vec::new();
        if page == 0x3f || page == 0x08 {
            caching_mode_page(&mut pages, self.write_cache);
        }

        let dsp = 0x10; // device-specific parameter: DPO/FUA supported
        let mut data = if cmd.opcode() == opcodes::MODE_SENSE_6 {
            vec![pages.len() as u8 + 3, 0x00, dsp, 0x00]
        } else {
            let mut hdr = vec![0u8; 8];
            hdr[0..2].copy_from_slice(&(pages.len() as u16 + 6).to_be_bytes());
            hdr[3] = dsp;
            hdr
        };
        data.extend_from_slice(&pages);
        data.truncate(alloc);

        cmd.data_in().write_all(&data)?;
        Ok(cmd.ok())
    }

    /// MODE SELECT only accepts the exact page MODE SENSE hands out; nothing
    /// here is actually settable.
    fn mode_select(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        let hdr_len = if cmd.opcode() == opcodes::MODE_SELECT_10 {
            8
        } else {
            4
        };
        let list_len = cmd.allocation_length() as usize;
        if list_len == 0 {
            return Ok(cmd.ok());
        }

        let flags = cmd.cdb()[1];
        if flags & 0x10 == 0 || flags & 0x01 != 0 {
            // require PF, reject SP
            return Ok(cmd.illegal_request());
        }

        let mut submitted = vec![0u8; list_len];
        let mut filled = 0;
        let mut stream = cmd.data_out();
        while filled < list_len {
            let n = stream.read(&mut submitted[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        let mut page = Vec::new();
        caching_mode_page(&mut page, self.write_cache);

        if filled < hdr_len + page.len() {
            return Ok(cmd.check_condition(sense::PARAMETER_LIST_LENGTH_ERROR));
        }
        if submitted[hdr_len..hdr_len + page.len()] != page[..] {
            return Ok(cmd.check_condition(sense::INVALID_FIELD_IN_PARAMETER_LIST));
        }
        Ok(cmd.ok())
    }
}

impl ScsiCmdHandler for EmulatedLun {
    fn handle_command(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
        debug!("command {:#04x}, id {}", cmd.opcode(), cmd.id());
        match cmd.opcode() {
            opcodes::TEST_UNIT_READY => Ok(cmd.ok()),
            opcodes::INQUIRY => self.inquiry(cmd),
            opcodes::READ_6 | opcodes::READ_10 | opcodes::READ_12 | opcodes::READ_16 => {
                self.read(cmd)
            }
            opcodes::WRITE_6 | opcodes::WRITE_10 | opcodes::WRITE_12 | opcodes::WRITE_16 => {
                self.write(cmd)
            }
            opcodes::SERVICE_ACTION_IN_16 => self.service_action_in(cmd),
            opcodes::MODE_SENSE_6 | opcodes::MODE_SENSE_10 => self.mode_sense(cmd),
            opcodes::MODE_SELECT_6 | opcodes::MODE_SELECT_10 => self.mode_select(cmd),
            op => {
                warn!("rejecting unimplemented command {op:#04x}");
                Ok(cmd.not_handled())
            }
        }
    }
}
