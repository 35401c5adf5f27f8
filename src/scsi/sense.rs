// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

/// A sense key plus additional sense code and qualifier, the triple that
/// identifies a SCSI error condition.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct SenseTriple(pub u8, pub u8, pub u8);

impl SenseTriple {
    /// Encode as fixed-format sense data (SPC-4 4.5.3). TCMU gives us a
    /// 96-byte sense buffer; anything past these 18 bytes stays zero.
    pub fn to_fixed_sense(self) -> Vec<u8> {
        vec![
            0x70,   // response code (fixed, current); valid bit (0)
            0x0,    // reserved
            self.0, // sk; various upper bits 0
            0x0, 0x0, 0x0, 0x0, // information
            0xa, // add'l sense length
            0x0, 0x0, 0x0, 0x0,    // cmd-specific information
            self.1, // asc
            self.2, // ascq
            0x0,    // field-replacable unit code
            0x0, 0x0, 0x0, // sense-key-specific information
        ]
    }
}

const MEDIUM_ERROR: u8 = 0x3;
const HARDWARE_ERROR: u8 = 0x4;
const ILLEGAL_REQUEST: u8 = 0x5;

pub const INVALID_COMMAND_OPERATION_CODE: SenseTriple = SenseTriple(ILLEGAL_REQUEST, 0x20, 0x0);
pub const INVALID_FIELD_IN_CDB: SenseTriple = SenseTriple(ILLEGAL_REQUEST, 0x24, 0x0);
pub const INVALID_FIELD_IN_PARAMETER_LIST: SenseTriple = SenseTriple(ILLEGAL_REQUEST, 0x26, 0x0);
pub const PARAMETER_LIST_LENGTH_ERROR: SenseTriple = SenseTriple(ILLEGAL_REQUEST, 0x1a, 0x0);

pub const READ_ERROR: SenseTriple = SenseTriple(MEDIUM_ERROR, 0x11, 0x0);

pub const INTERNAL_TARGET_FAILURE: SenseTriple = SenseTriple(HARDWARE_ERROR, 0x44, 0x0);
