// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! SCSI world-wide names in NAA registered / registered-extended format.

use md5::{Digest, Md5};

use crate::tcmu::{Error, Result};

/// An NAA world-wide name. The same identity serves as both the loopback
/// device id and the nexus id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaaWwn {
    /// First six hex digits of the IEEE Organizationally Unique Identifier.
    oui: String,
    /// Eight hex digits of vendor-specific identity, e.g. a serial number.
    vendor_id: String,
    /// Optional sixteen more hex digits; selects the registered-extended
    /// (`naa.6`) form.
    vendor_id_ext: String,
}

impl NaaWwn {
    pub fn new(oui: &str, vendor_id: &str, vendor_id_ext: &str) -> Result<Self> {
        if oui.len() != 6 {
            return Err(Error::InvalidWwn(format!(
                "OUI must be exactly 6 hex characters, got {oui:?}"
            )));
        }
        if vendor_id.len() != 8 {
            return Err(Error::InvalidWwn(format!(
                "vendor id must be exactly 8 hex characters, got {vendor_id:?}"
            )));
        }
        if !vendor_id_ext.is_empty() && vendor_id_ext.len() != 16 {
            return Err(Error::InvalidWwn(format!(
                "vendor id extension must be empty or 16 hex characters, got {vendor_id_ext:?}"
            )));
        }
        Ok(Self {
            oui: oui.to_string(),
            vendor_id: vendor_id.to_string(),
            vendor_id_ext: vendor_id_ext.to_string(),
        })
    }

    /// The default identity for a volume: zero OUI, serial derived from the
    /// volume name.
    pub fn for_volume(name: &str) -> Self {
        Self {
            oui: "000000".to_string(),
            vendor_id: serial(name),
            vendor_id_ext: String::new(),
        }
    }

    pub fn device_id(&self) -> String {
        self.gen_id()
    }

    pub fn nexus_id(&self) -> String {
        self.gen_id()
    }

    fn gen_id(&self) -> String {
        let naa = if self.vendor_id_ext.len() == 16 {
            "naa.6"
        } else {
            "naa.5"
        };
        format!(
            "{naa}{}1{}{}",
            self.oui, self.vendor_id, self.vendor_id_ext
        )
    }
}

/// First eight hex digits of the MD5 of `name`.
pub fn serial(name: &str) -> String {
    let digest = Md5::digest(name.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_is_md5_prefix() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        assert_eq!(serial("abc"), "90015098");
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(serial(""), "d41d8cd9");
    }

    #[test]
    fn test_volume_identity_shape() {
        let wwn = NaaWwn::for_volume("vol1");
        let id = wwn.device_id();
        assert_eq!(id, wwn.nexus_id());
        assert_eq!(id.len(), 20);
        assert!(id.starts_with("naa.5"));
        assert_eq!(&id[5..11], "000000");
        assert_eq!(&id[11..12], "1");
    }

    #[test]
    fn test_extended_form() {
        let wwn = NaaWwn::new("05abcd", "2416c05f", "0011223344556677").unwrap();
        let id = wwn.device_id();
        assert!(id.starts_with("naa.6"));
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_component_validation() {
        assert!(NaaWwn::new("05abc", "2416c05f", "").is_err());
        assert!(NaaWwn::new("05abcd", "2416c05", "").is_err());
        assert!(NaaWwn::new("05abcd", "2416c05f", "0011").is_err());
        assert!(NaaWwn::new("05abcd", "2416c05f", "").is_ok());
    }
}
