//! Decoding and encoding of NTLM messages.
//!
//! The server only ever decodes Negotiate and Authenticate messages and only ever encodes Challenge
//! messages. Decoded messages borrow the buffer they were decoded from: the variable-length items of
//! a [`NegotiateMessage`] or [`AuthenticateMessage`] are slices of that buffer, so the buffer must
//! outlive the message. Copy the items out if they are needed for longer.


use crate::{Error, Flags, NTLMSSP_MAGIC, StoringError};
use crate::field::{FieldView, SecurityBuffer};
use crate::os_version::OsVersion;


/// Length of the fixed part of an Authenticate message, up to and including the workstation name.
pub const AUTHENTICATE_MIN_LEN: usize = 52;

/// Length of the fixed part of a Challenge message, including the version block.
pub const CHALLENGE_HEADER_LEN: usize = 56;

// byte offsets within an Authenticate message
const LM_RESPONSE_SECBUF: usize = 12;
const NTLM_RESPONSE_SECBUF: usize = 20;
const TARGET_NAME_SECBUF: usize = 28;
const USER_NAME_SECBUF: usize = 36;
const WORKSTATION_NAME_SECBUF: usize = 44;
const SESSION_KEY_SECBUF: usize = 52;
const AUTHENTICATE_FLAGS: usize = 60;
const AUTHENTICATE_VERSION: usize = 64;


/// The type of an NTLM message as announced in its header.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MessageType {
    Negotiate,
    Challenge,
    Authenticate,
    Unknown,
}
impl MessageType {
    /// Returns the 32-bit message number identifying this type, if it is a known one.
    pub fn message_number(&self) -> Option<u32> {
        match self {
            Self::Negotiate => Some(0x0000_0001),
            Self::Challenge => Some(0x0000_0002),
            Self::Authenticate => Some(0x0000_0003),
            Self::Unknown => None,
        }
    }

    /// Maps a raw message number to its type; unknown numbers become [`MessageType::Unknown`].
    pub fn from_message_number(number: u32) -> Self {
        match number {
            0x0000_0001 => Self::Negotiate,
            0x0000_0002 => Self::Challenge,
            0x0000_0003 => Self::Authenticate,
            _ => Self::Unknown,
        }
    }
}

/// Determines which NTLM message `bytes` contains.
///
/// Anything shorter than the 12-byte header or not starting with the NTLMSSP magic is
/// [`MessageType::Unknown`].
pub fn detect_message_type(bytes: &[u8]) -> MessageType {
    read_message_number(bytes)
        .map(MessageType::from_message_number)
        .unwrap_or(MessageType::Unknown)
}

/// Checks the magic and returns the raw message number of the message in `bytes`.
pub fn read_message_number(bytes: &[u8]) -> Result<u32, Error> {
    let view = FieldView::new(bytes);
    if view.len() < 12 {
        return Err(Error::Truncated { expected_min_len: 12, obtained_len: view.len() });
    }
    let magic: [u8; 8] = view.read_array(0)?;
    if magic != NTLMSSP_MAGIC {
        return Err(Error::MagicMismatch { expected: NTLMSSP_MAGIC, obtained: Vec::from(magic) });
    }
    view.read_u32(8)
}

/// Checks the magic and the message type of a message that must be at least `min_len` bytes long.
fn check_header(view: &FieldView<'_>, expected: MessageType, min_len: usize) -> Result<(), Error> {
    if view.len() < min_len {
        return Err(Error::Truncated { expected_min_len: min_len, obtained_len: view.len() });
    }
    let number = read_message_number(view.as_bytes())?;
    let expected_number = expected.message_number().unwrap_or(0);
    if number != expected_number {
        return Err(Error::UnexpectedMessageType { expected: expected_number, obtained: number });
    }
    Ok(())
}


/// Converts UTF-16 values stored as bytes in little-endian format into a string.
fn utf16_le_bytes_to_string(bytes: &[u8]) -> Result<String, Error> {
    if bytes.len() % 2 != 0 {
        return Err(Error::ItemLengthNotDivisible { expected_divisor: 2, obtained_length: bytes.len() });
    }
    let u16s: Vec<u16> = bytes.chunks_exact(2)
        .map(|chk| u16::from_le_bytes([chk[0], chk[1]]))
        .collect();
    String::from_utf16(&u16s)
        .or(Err(Error::InvalidUtf16 { value: u16s }))
}

/// Decodes a string item of a message according to the negotiated `flags`.
///
/// Only Unicode (UTF-16LE) strings are supported; without [`Flags::NEGOTIATE_UNICODE`] the result
/// is [`Error::UnsupportedCharset`]. Odd lengths and unpaired surrogates are errors.
pub fn decode_string(flags: Flags, bytes: &[u8]) -> Result<String, Error> {
    if !flags.contains(Flags::NEGOTIATE_UNICODE) {
        return Err(Error::UnsupportedCharset { flags });
    }
    utf16_le_bytes_to_string(bytes)
}


/// The contents of an NTLM Negotiate message.
///
/// The Negotiate message is the first message in an NTLM challenge-response process and is sent by
/// the client to the server; the server is expected to respond with a Challenge message.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateMessage<'a> {
    /// Stores which information has been specified and which NTLM behavior should be negotiated.
    pub flags: Flags,

    /// The domain against which the client wishes to authenticate, in the OEM encoding.
    pub supplied_domain: &'a [u8],

    /// The NT hostname of the client, in the OEM encoding.
    pub supplied_workstation: &'a [u8],

    /// Version information about the client's operating system.
    pub os_version: OsVersion,
}
impl<'a> TryFrom<&'a [u8]> for NegotiateMessage<'a> {
    type Error = Error;

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        let view = FieldView::new(value);
        check_header(&view, MessageType::Negotiate, 16)?;

        let flags = Flags::from_bits_retain(view.read_u32(12)?);

        // very old clients stop right after the flags
        let (supplied_domain, supplied_workstation) = if view.len() >= 32 {
            (view.field(16)?.1, view.field(24)?.1)
        } else {
            (&value[0..0], &value[0..0])
        };

        let os_version = if flags.contains(Flags::NEGOTIATE_VERSION) && view.len() >= 40 {
            OsVersion::from_raw(view.read_array(32)?)
        } else {
            OsVersion::default()
        };

        Ok(Self {
            flags,
            supplied_domain,
            supplied_workstation,
            os_version,
        })
    }
}


/// The type of additional target information included in the Challenge message.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TargetInfoType {
    Terminator,
    NtServer,
    NtDomain,
    DnsDomain,
    DnsServer,
    DnsForest,
    Flags,
    Timestamp,
    SingleHost,
    TargetName,
    ChannelBindings,
    Unknown(u16),
}
impl From<TargetInfoType> for u16 {
    fn from(t: TargetInfoType) -> Self {
        match t {
            TargetInfoType::Terminator => 0x0000,
            TargetInfoType::NtServer => 0x0001,
            TargetInfoType::NtDomain => 0x0002,
            TargetInfoType::DnsServer => 0x0003,
            TargetInfoType::DnsDomain => 0x0004,
            TargetInfoType::DnsForest => 0x0005,
            TargetInfoType::Flags => 0x0006,
            TargetInfoType::Timestamp => 0x0007,
            TargetInfoType::SingleHost => 0x0008,
            TargetInfoType::TargetName => 0x0009,
            TargetInfoType::ChannelBindings => 0x000A,
            TargetInfoType::Unknown(w) => w,
        }
    }
}

/// An entry of additional target information included in the Challenge message.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TargetInfoEntry {
    pub entry_type: TargetInfoType,
    pub data: Vec<u8>,
}
impl TargetInfoEntry {
    /// Creates a target info entry from an entry type and a string.
    pub fn from_string(entry_type: TargetInfoType, string: &str) -> Self {
        // always Unicode, even if flags claim OEM
        let data: Vec<u8> = string.encode_utf16()
            .flat_map(|b| b.to_le_bytes())
            .collect();
        Self {
            entry_type,
            data,
        }
    }

    /// Creates a timestamp entry from an NTLM time value (tenths of a microsecond since 1601).
    pub fn timestamp(ntlm_time: i64) -> Self {
        Self {
            entry_type: TargetInfoType::Timestamp,
            data: Vec::from(ntlm_time.to_le_bytes()),
        }
    }

    /// Creates the entry that terminates a list of target info entries.
    pub fn terminator() -> Self {
        Self {
            entry_type: TargetInfoType::Terminator,
            data: Vec::new(),
        }
    }

    /// Serializes the target info entry into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let entry_type_u16: u16 = self.entry_type.into();
        let bytes_len: u16 = self.data.len().try_into()
            .or(Err(StoringError::ItemTooLong { length: self.data.len() }))?;

        let mut ret = Vec::with_capacity(4 + self.data.len());
        ret.extend_from_slice(&entry_type_u16.to_le_bytes());
        ret.extend_from_slice(&bytes_len.to_le_bytes());
        ret.extend_from_slice(&self.data);
        Ok(ret)
    }
}


/// The contents of an NTLM Challenge message.
///
/// The Challenge message is sent by the server in response to the client's Negotiate message; the
/// client is expected to respond with an Authenticate message.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChallengeMessage {
    /// The host or domain against which the client is authenticating.
    pub target_name: String,

    /// Stores which NTLM behavior has been accepted by the server from the client's request.
    pub flags: Flags,

    /// The challenge value.
    pub challenge: [u8; 8],

    /// Information about the targets of the authentication. Should end with a terminator entry.
    pub target_information: Vec<TargetInfoEntry>,

    /// Version information about the server's operating system.
    pub os_version: OsVersion,
}
impl ChallengeMessage {
    /// Serializes the complete Challenge message, including magic and message type.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let target_name_bytes = if self.flags.contains(Flags::NEGOTIATE_UNICODE) {
            self.target_name.encode_utf16()
                .flat_map(|w| w.to_le_bytes())
                .collect()
        } else if self.flags.contains(Flags::NEGOTIATE_OEM) {
            Vec::from(self.target_name.as_bytes())
        } else {
            return Err(StoringError::NeitherUnicodeNorOem);
        };
        let mut target_info_bytes = Vec::new();
        for entry in &self.target_information {
            target_info_bytes.append(&mut entry.to_bytes()?);
        }

        let mut sec_buffer_offset = CHALLENGE_HEADER_LEN as u32;
        let mut ret = Vec::with_capacity(CHALLENGE_HEADER_LEN + target_name_bytes.len() + target_info_bytes.len());
        let mut data_block = Vec::new();

        ret.extend_from_slice(&NTLMSSP_MAGIC);
        ret.extend_from_slice(&0x0000_0002u32.to_le_bytes());
        append_sec_buffer(&mut ret, &mut data_block, &mut sec_buffer_offset, &target_name_bytes)?;
        ret.extend_from_slice(&self.flags.bits().to_le_bytes());
        ret.extend_from_slice(&self.challenge);
        ret.extend_from_slice(&[0u8; 8]); // reserved context
        append_sec_buffer(&mut ret, &mut data_block, &mut sec_buffer_offset, &target_info_bytes)?;
        ret.extend_from_slice(&self.os_version.to_bytes());
        ret.append(&mut data_block);
        Ok(ret)
    }
}

/// Reads the negotiated flags from an encoded Challenge message.
pub fn challenge_flags(bytes: &[u8]) -> Result<Flags, Error> {
    let view = FieldView::new(bytes);
    check_header(&view, MessageType::Challenge, 24)?;
    Ok(Flags::from_bits_retain(view.read_u32(20)?))
}

/// Appends a security buffer to the end of a message.
///
/// The security buffer is appended to `message_bytes` while the data itself is appended to
/// `data_block`, which is placed after the fixed header once that is complete.
/// `sec_buffer_offset` keeps track of the next free offset.
fn append_sec_buffer(message_bytes: &mut Vec<u8>, data_block: &mut Vec<u8>, sec_buffer_offset: &mut u32, data: &[u8]) -> Result<(), StoringError> {
    let length: u16 = data.len().try_into()
        .or(Err(StoringError::ItemTooLong { length: data.len() }))?;
    data_block.extend_from_slice(data);

    let sb = SecurityBuffer::new(length, *sec_buffer_offset);
    message_bytes.extend_from_slice(&sb.to_bytes());

    *sec_buffer_offset += u32::from(length);
    Ok(())
}


/// The contents of an NTLM Authenticate message.
///
/// The Authenticate message is sent by the client in response to the server's Challenge message;
/// once it is accepted by the server, the authentication has succeeded. All byte items point into
/// the decoded buffer.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AuthenticateMessage<'a> {
    pub lm_response: &'a [u8],
    pub ntlm_response: &'a [u8],

    /// The domain of the user, encoded according to the flags.
    pub target_name: &'a [u8],
    pub user_name: &'a [u8],
    pub workstation_name: &'a [u8],

    /// The encrypted session key; `None` if the message is too short to contain one.
    pub session_key: Option<&'a [u8]>,

    /// The negotiated flags; `None` if the message is too short to contain them.
    pub flags: Option<Flags>,

    /// Version information about the client's operating system; empty if absent.
    pub os_version: OsVersion,
}
impl<'a> AuthenticateMessage<'a> {
    /// Returns the flags of this message, or `fallback` if the message carries none.
    pub fn flags_or(&self, fallback: Flags) -> Flags {
        self.flags.unwrap_or(fallback)
    }

    pub fn decode_user_name(&self, flags: Flags) -> Result<String, Error> {
        decode_string(flags, self.user_name)
    }

    pub fn decode_target_name(&self, flags: Flags) -> Result<String, Error> {
        decode_string(flags, self.target_name)
    }

    pub fn decode_workstation_name(&self, flags: Flags) -> Result<String, Error> {
        decode_string(flags, self.workstation_name)
    }
}

/// Reads the security buffer at `at`, keeping track of the largest offset seen so far.
fn tracked_field<'a>(view: &FieldView<'a>, at: usize, max_offset: &mut u32) -> Result<&'a [u8], Error> {
    let (sb, data) = view.field(at)?;
    if sb.offset > *max_offset {
        *max_offset = sb.offset;
    }
    Ok(data)
}

impl<'a> TryFrom<&'a [u8]> for AuthenticateMessage<'a> {
    type Error = Error;

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        let view = FieldView::new(value);
        check_header(&view, MessageType::Authenticate, AUTHENTICATE_MIN_LEN)?;

        // The optional trailing items (session key, flags, version) are not announced anywhere.
        // Their presence is inferred from where the payload starts: the items sit between the
        // fixed header and the lowest payload offset, so the largest offset seen must lie beyond
        // them. Real clients depend on exactly this rule.
        let mut min_offset: u32 = 0;
        let lm_response = tracked_field(&view, LM_RESPONSE_SECBUF, &mut min_offset)?;
        let ntlm_response = tracked_field(&view, NTLM_RESPONSE_SECBUF, &mut min_offset)?;
        let target_name = tracked_field(&view, TARGET_NAME_SECBUF, &mut min_offset)?;
        let user_name = tracked_field(&view, USER_NAME_SECBUF, &mut min_offset)?;
        let workstation_name = tracked_field(&view, WORKSTATION_NAME_SECBUF, &mut min_offset)?;

        let mut session_key = None;
        let mut flags = None;
        if min_offset >= 64 && view.len() >= 64 {
            session_key = Some(tracked_field(&view, SESSION_KEY_SECBUF, &mut min_offset)?);
            flags = Some(Flags::from_bits_retain(view.read_u32(AUTHENTICATE_FLAGS)?));
        }

        // Clients that omit the version block but start their payload beyond offset 72 get their
        // payload read as a version. The revision byte is therefore not checked here.
        let mut os_version = OsVersion::default();
        if min_offset >= 72 && view.len() >= 72 {
            os_version = OsVersion::from_raw(view.read_array(AUTHENTICATE_VERSION)?);
        }

        Ok(Self {
            lm_response,
            ntlm_response,
            target_name,
            user_name,
            workstation_name,
            session_key,
            flags,
            os_version,
        })
    }
}
