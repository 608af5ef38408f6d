//! The OS version structure that may trail NTLM messages.


use std::fmt;

use crate::Error;


/// The only NTLM revision accepted in an OS version structure.
pub const NTLMSSP_REVISION_W2K3: u8 = 0x0F;


/// A structure representing the version of an operating system as well as the NTLM revision used.
///
/// The version information is optional on the wire. A major version of zero stands for "absent";
/// see [`OsVersion::is_empty`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OsVersion {
    pub major_version: u8,
    pub minor_version: u8,
    pub build_number: u16,
    pub reserved: [u8; 3],
    pub ntlm_revision: u8,
}

impl OsVersion {
    /// Takes the 8 bytes apart without checking the NTLM revision.
    pub fn from_raw(bytes: [u8; 8]) -> Self {
        OsVersion {
            major_version: bytes[0],
            minor_version: bytes[1],
            build_number: u16::from_le_bytes([bytes[2], bytes[3]]),
            reserved: [bytes[4], bytes[5], bytes[6]],
            ntlm_revision: bytes[7],
        }
    }

    /// Whether this structure carries no version information.
    pub fn is_empty(&self) -> bool {
        self.major_version == 0
    }

    /// Serializes the OS version structure into bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let build = self.build_number.to_le_bytes();
        [
            self.major_version,
            self.minor_version,
            build[0],
            build[1],
            self.reserved[0],
            self.reserved[1],
            self.reserved[2],
            self.ntlm_revision,
        ]
    }
}

impl TryFrom<&[u8]> for OsVersion {
    type Error = Error;

    /// Decodes exactly 8 bytes. The NTLM revision byte must be `0x0F`; other revisions are rejected.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 8] = value.try_into()
            .or(Err(Error::ItemLengthMismatch { expected: 8, obtained: value.len() }))?;

        if bytes[7] != NTLMSSP_REVISION_W2K3 {
            return Err(Error::NtlmRevisionMismatch { expected: NTLMSSP_REVISION_W2K3, obtained: bytes[7] });
        }

        Ok(OsVersion::from_raw(bytes))
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major_version, self.minor_version, self.build_number)
    }
}
