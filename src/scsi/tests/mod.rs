// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause


use std::{
    io::{Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use vm_memory::{mmap::MmapRegion, Bytes, VolatileMemory};

use super::{
    emulation::EmulatedLun, sense::SenseTriple, BlockBackend, DataSizes, InquiryInfo, ScsiCmd,
    ScsiCmdHandler, ScsiResponse, SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD,
};

const REGION_SIZE: usize = 1 << 20;

/// Build a command whose IOVs are consecutive segments at the start of an
/// anonymous region standing in for the kernel mapping.
fn make_cmd(cdb: &[u8], seg_lens: &[usize]) -> (Arc<MmapRegion>, ScsiCmd) {
    let region = Arc::new(MmapRegion::new(REGION_SIZE).unwrap());
    let mut iovs = Vec::new();
    let mut at = 0;
    for &len in seg_lens {
        iovs.push((at, len));
        at += len;
    }
    let cmd = ScsiCmd::new(0, cdb.to_vec(), Arc::clone(&region), iovs);
    (region, cmd)
}

/// Read back what a handler wrote through the command's data-in stream.
fn data_written(region: &MmapRegion, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    region.as_volatile_slice().read_slice(&mut out, 0).unwrap();
    out
}

fn test_sizes() -> DataSizes {
    DataSizes {
        volume_size: 1 << 30,
        sector_size: 512,
    }
}

fn test_lun(backend: Box<dyn BlockBackend>) -> EmulatedLun {
    EmulatedLun::new(
        backend,
        InquiryInfo {
            vendor_id: "acme".to_string(),
            product_id: "widget".to_string(),
            product_rev: "1".to_string(),
        },
        test_sizes(),
        "libtcmu//test".to_string(),
        PathBuf::from("/nonexistent/attrib"),
    )
}

/// A byte-vector backend; the simplest thing positional I/O can run on.
struct MemBackend {
    data: Mutex<Vec<u8>>,
}

impl MemBackend {
    fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len]),
        }
    }
}

impl BlockBackend for MemBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        let n = buf.len().min(data.len().saturating_sub(offset));
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }
}

fn null_backend() -> Box<dyn BlockBackend> {
    Box::new(MemBackend::new(0))
}

fn run(lun: &EmulatedLun, cmd: &mut ScsiCmd) -> ScsiResponse {
    lun.handle_command(cmd).unwrap()
}

fn do_command_in(lun: &EmulatedLun, cdb: &[u8], expected_data_in: &[u8]) {
    let (region, mut cmd) = make_cmd(cdb, &[4096]);
    let resp = run(lun, &mut cmd);
    assert_eq!(resp.status(), SAM_STAT_GOOD, "sense: {:?}", resp.sense());
    assert_eq!(data_written(&region, expected_data_in.len()), expected_data_in);
}

fn do_command_fail(lun: &EmulatedLun, cdb: &[u8], expected_sense: SenseTriple) {
    let (_region, mut cmd) = make_cmd(cdb, &[4096]);
    let resp = run(lun, &mut cmd);
    assert_eq!(resp.status(), SAM_STAT_CHECK_CONDITION);
    assert_eq!(resp.sense(), expected_sense.to_fixed_sense());
}

#[test]
fn test_test_unit_ready() {
    let lun = test_lun(null_backend());
    do_command_in(&lun, &[0, 0, 0, 0, 0, 0], &[]);
}

#[test]
fn test_standard_inquiry() {
    let lun = test_lun(null_backend());
    do_command_in(
        &lun,
        &[
            0x12, // INQUIRY
            0,    // EVPD bit: 0
            0,    // page code
            1, 0, // alloc length: 256
            0, // control
        ],
        &[
            0,    // accessible; direct access block device
            0,    // features
            0x05, // version: SPC-3
            0x02, // response data format
            31,   // additional length
            0, 0,    // unsupported features
            0x02, // CmdQue
            // vendor
            b'a', b'c', b'm', b'e', b' ', b' ', b' ', b' ', //
            // product
            b'w', b'i', b'd', b'g', b'e', b't', b' ', b' ', b' ', b' ', b' ', b' ', b' ', b' ',
            b' ', b' ', //
            // revision
            b'1', b' ', b' ', b' ', //
        ],
    );
}

#[test]
fn test_standard_inquiry_rejects_nonzero_page() {
    let lun = test_lun(null_backend());
    do_command_fail(
        &lun,
        &[
            0x12, // INQUIRY
            0,    // EVPD bit: 0
            0x80, // page code is only valid with EVPD
            1, 0, // alloc length
            0, // control
        ],
        super::sense::INVALID_FIELD_IN_CDB,
    );
}

#[test]
fn test_read_capacity_16() {
    // 1 GiB / 512-byte sectors: last LBA 0x1f_ffff
    let lun = test_lun(null_backend());
    do_command_in(
        &lun,
        &[
            0x9e, 0x10, // SERVICE ACTION IN(16) / READ CAPACITY(16)
            0, 0, 0, 0, 0, 0, 0, 0, // obsolete
            0, 0, 0, 32, // allocation length
            0,  // reserved
            0,  // control
        ],
        &[
            0, 0, 0, 0, 0, 0x1f, 0xff, 0xff, // returned (last) LBA
            0, 0, 2, 0, // sector size: 512
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // reserved
        ],
    );
}

#[test]
fn test_unknown_service_action() {
    let lun = test_lun(null_backend());
    do_command_fail(
        &lun,
        &[
            0x9e, 0x1f, // SERVICE ACTION IN(16), bogus action
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        super::sense::INVALID_COMMAND_OPERATION_CODE,
    );
}

#[test]
fn test_unknown_opcode() {
    let lun = test_lun(null_backend());
    do_command_fail(
        &lun,
        &[
            0xff, // vendor specific, unused by us
            0, 0, 0, 0, 0,
        ],
        super::sense::INVALID_COMMAND_OPERATION_CODE,
    );
}

#[test]
fn test_read_6_decodes_zero_transfer_as_256() {
    let (_region, cmd) = make_cmd(
        &[
            0x08, // READ (6)
            0, 0, 0, // LBA 0
            0, // transfer length: 0, i.e. 256 blocks
            0, // control
        ],
        &[],
    );
    assert_eq!(cmd.lba(), 0);
    assert_eq!(cmd.xfer_len(), 0);
    assert_eq!(cmd.transfer_length(), 256);
}

#[test]
fn test_cdb_field_decoding() {
    let (_region, cmd) = make_cmd(
        &[
            0x28, // READ (10)
            0, 0x01, 0x02, 0x03, 0x04, // LBA
            0, 0x10, 0x20, // transfer length
            0,
        ],
        &[],
    );
    assert_eq!(cmd.lba(), 0x0102_0304);
    assert_eq!(cmd.transfer_length(), 0x1020);

    let (_region, cmd) = make_cmd(
        &[
            0xa8, // READ (12)
            0, 0x01, 0x02, 0x03, 0x04, // LBA
            0x00, 0x00, 0x01, 0x00, // transfer length
            0, 0,
        ],
        &[],
    );
    assert_eq!(cmd.lba(), 0x0102_0304);
    assert_eq!(cmd.transfer_length(), 0x100);

    let (_region, cmd) = make_cmd(
        &[
            0x88, // READ (16)
            0, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, // LBA
            0x00, 0x00, 0x00, 0x08, // transfer length
            0, 0,
        ],
        &[],
    );
    assert_eq!(cmd.lba(), 0x01_0203_0405);
    assert_eq!(cmd.transfer_length(), 8);
}

#[test]
fn test_data_in_stream_rolls_over_segments() {
    let (region, mut cmd) = make_cmd(&[0; 6], &[5, 7]);
    // partial writes must advance within a segment and roll to the next
    cmd.data_in().write_all(&[1, 2, 3]).unwrap();
    cmd.data_in().write_all(&[4, 5, 6, 7, 8, 9]).unwrap();
    assert_eq!(data_written(&region, 9), [1, 2, 3, 4, 5, 6, 7, 8, 9]);

    // the stream ends with the last segment
    cmd.data_in().write_all(&[10, 11, 12]).unwrap();
    let err = cmd.data_in().write_all(&[13]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WriteZero);
}

#[test]
fn test_data_out_stream_rolls_over_segments() {
    let (region, mut cmd) = make_cmd(&[0; 6], &[5, 7]);
    region
        .as_volatile_slice()
        .write_slice(&[9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 11, 22], 0)
        .unwrap();

    // a short read mid-segment must not lose position
    let mut first = [0u8; 3];
    cmd.data_out().read_exact(&mut first).unwrap();
    assert_eq!(first, [9, 8, 7]);

    let mut rest = [0u8; 9];
    cmd.data_out().read_exact(&mut rest).unwrap();
    assert_eq!(rest, [6, 5, 4, 3, 2, 1, 0, 11, 22]);

    // exhausted
    let mut more = [0u8; 1];
    assert_eq!(cmd.data_out().read(&mut more).unwrap(), 0);
}
