//! Server-side NTLM authentication for HTTP.
//!
//! NTLM authenticates a client in three messages (Negotiate, Challenge, Authenticate) carried in
//! `Authorization` and `WWW-Authenticate` headers. HTTP keeps no session between those requests, so
//! [`Policy`] correlates them per transport connection and hands the cryptographic work to a
//! [`SecurityProvider`].
//!
//! Sample usage:
//! ```
//! use std::net::SocketAddr;
//!
//! use ntlmserver::{PasswordProvider, Policy, PolicyConfig};
//!
//! // the credentials are valid if the password is the username repeated twice
//! let provider = PasswordProvider::new("EXAMPLE", "WEBSERVER", |user: &str, _domain: &str| {
//!     Some(format!("{}{}", user, user))
//! });
//! let policy: Policy<_, SocketAddr> = Policy::new(provider, PolicyConfig::default())
//!     .expect("failed to set up the NTLM policy");
//!
//! // the HTTP server stores the peer address of the connection in the request extensions
//! let peer: SocketAddr = "192.0.2.7:50123".parse().unwrap();
//! let mut request = http::Request::get("/example/").body(()).unwrap();
//! request.extensions_mut().insert(peer);
//!
//! let username = policy.authorize(&request);
//! if username.is_empty() {
//!     // access denied; ask the client to start (or continue) the NTLM handshake
//!     let response = policy.notify_auth_required(&request);
//!     assert_eq!(response.status(), http::StatusCode::UNAUTHORIZED);
//!     assert_eq!(response.headers()["www-authenticate"], "NTLM");
//! }
//! ```


pub mod crypto;
pub mod field;
pub mod handshake;
pub mod message;
pub mod os_version;
pub mod policy;
pub mod provider;


use std::fmt;

use bitflags::bitflags;

pub use crate::field::{FieldView, SecurityBuffer};
pub use crate::handshake::{HandshakeCoordinator, HandshakeState, Identity, Step};
pub use crate::message::{
    AuthenticateMessage, ChallengeMessage, MessageType, NegotiateMessage, TargetInfoEntry,
    TargetInfoType, challenge_flags, decode_string, detect_message_type, read_message_number,
};
pub use crate::os_version::OsVersion;
pub use crate::policy::{
    DefaultUnauthorizedBody, Diagnostic, HandshakePending, Policy, PolicyConfig,
    STATUS_UNAUTHORIZED_HTML, UnauthorizedBody,
};
pub use crate::provider::{PasswordProvider, SecurityProvider};


/// The magic value at the start of every NTLMSSP data packet.
pub const NTLMSSP_MAGIC: [u8; 8] = *b"NTLMSSP\0";


bitflags! {
    /// NTLM negotiation flags.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct Flags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const UNKNOWN_8 = 0x0000_0008;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LANMAN_KEY = 0x0000_0080;
        const NEGOTIATE_NETWARE = 0x0000_0100;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const UNKNOWN_400 = 0x0000_0400;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_LOCAL_CALL = 0x0000_4000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_SHARE = 0x0004_0000;
        const NEGOTIATE_NTLM2_KEY = 0x0008_0000;
        const REQUEST_INIT_RESPONSE = 0x0010_0000;
        const REQUEST_ACCEPT_RESPONSE = 0x0020_0000;
        const REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const UNKNOWN_1000000 = 0x0100_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const UNKNOWN_4000000 = 0x0400_0000;
        const UNKNOWN_8000000 = 0x0800_0000;
        const UNKNOWN_10000000 = 0x1000_0000;
        const NEGOTIATE_128BIT = 0x2000_0000;
        const NEGOTIATE_KEY_EXCHANGE = 0x4000_0000;
        const NEGOTIATE_56BIT = 0x8000_0000;
    }
}
impl Flags {
    /// Decodes the flags from their 4-byte little-endian wire form.
    ///
    /// Every bit is retained, including those without a name.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits_retain(u32::from_le_bytes(bytes))
    }
}


/// The category of an [`Error`], used when reporting authentication failures.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The buffer is shorter than a field demands.
    Truncated,

    /// The signature, message type, revision marker or an encoding is wrong.
    InvalidMessage,

    /// A string was requested but Unicode has not been negotiated.
    UnsupportedCharset,

    /// The security provider refused or failed.
    ProviderFailure,

    /// An Authenticate message arrived without a matching Negotiate message.
    NoContext,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Truncated => "truncated",
            Self::InvalidMessage => "invalid message",
            Self::UnsupportedCharset => "unsupported charset",
            Self::ProviderFailure => "provider failure",
            Self::NoContext => "no context",
        };
        f.write_str(name)
    }
}


/// An error that may occur while decoding NTLM messages or running a handshake.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    /// The buffer ends before a field does.
    Truncated { expected_min_len: usize, obtained_len: usize },

    /// The magic value does not match the expected one.
    MagicMismatch { expected: [u8; 8], obtained: Vec<u8> },

    /// The message is not of the expected type.
    UnexpectedMessageType { expected: u32, obtained: u32 },

    /// An internal item has a different length than expected.
    ItemLengthMismatch { expected: usize, obtained: usize },

    /// An internal item's length is not divisible by an expected divisor.
    ItemLengthNotDivisible { expected_divisor: usize, obtained_length: usize },

    /// The NTLM revision byte of an OS version structure is not the supported one.
    NtlmRevisionMismatch { expected: u8, obtained: u8 },

    /// A string of 16-bit characters could not be decoded.
    InvalidUtf16 { value: Vec<u16> },

    /// The header value is not valid base64.
    InvalidBase64 { reason: String },

    /// Unicode was not negotiated, so strings cannot be decoded.
    UnsupportedCharset { flags: Flags },

    /// The security provider refused the message or failed to process it.
    ProviderFailure(String),

    /// No handshake is pending for the client.
    NoContext,
}
impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Truncated { .. } => ErrorKind::Truncated,
            Self::MagicMismatch { .. }
            | Self::UnexpectedMessageType { .. }
            | Self::ItemLengthMismatch { .. }
            | Self::ItemLengthNotDivisible { .. }
            | Self::NtlmRevisionMismatch { .. }
            | Self::InvalidUtf16 { .. }
            | Self::InvalidBase64 { .. } => ErrorKind::InvalidMessage,
            Self::UnsupportedCharset { .. } => ErrorKind::UnsupportedCharset,
            Self::ProviderFailure(_) => ErrorKind::ProviderFailure,
            Self::NoContext => ErrorKind::NoContext,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { expected_min_len, obtained_len }
                => write!(f, "message truncated (expected at least {} bytes, obtained {})", expected_min_len, obtained_len),
            Self::MagicMismatch { expected, obtained }
                => write!(f, "mismatched magic (expected {:?}, obtained {:?})", expected, obtained),
            Self::UnexpectedMessageType { expected, obtained }
                => write!(f, "unexpected message type (expected {}, obtained {})", expected, obtained),
            Self::ItemLengthMismatch { expected, obtained }
                => write!(f, "wrong length for an internal item (expected {}, obtained {})", expected, obtained),
            Self::ItemLengthNotDivisible { expected_divisor, obtained_length }
                => write!(f, "item length {} not divisible by {}", obtained_length, expected_divisor),
            Self::NtlmRevisionMismatch { expected, obtained }
                => write!(f, "unsupported NTLM revision (expected 0x{:02X}, obtained 0x{:02X})", expected, obtained),
            Self::InvalidUtf16 { value }
                => write!(f, "failed to decode {} code units as UTF-16", value.len()),
            Self::InvalidBase64 { reason }
                => write!(f, "failed to decode base64 token: {}", reason),
            Self::UnsupportedCharset { flags }
                => write!(f, "Unicode strings were not negotiated (flags 0x{:08X})", flags.bits()),
            Self::ProviderFailure(reason)
                => write!(f, "security provider failure: {}", reason),
            Self::NoContext
                => write!(f, "no pending handshake for this client"),
        }
    }
}
impl std::error::Error for Error {
}

/// An error that may occur while writing an NTLM packet.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StoringError {
    /// Neither Unicode nor OEM encoding was selected.
    NeitherUnicodeNorOem,

    /// An item does not fit into the 16-bit length of a security buffer.
    ItemTooLong { length: usize },
}
impl fmt::Display for StoringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeitherUnicodeNorOem
                => write!(f, "neither Unicode nor OEM encoding was selected"),
            Self::ItemTooLong { length }
                => write!(f, "item of {} bytes is too long for a security buffer", length),
        }
    }
}
impl std::error::Error for StoringError {
}
impl From<StoringError> for Error {
    fn from(e: StoringError) -> Self {
        Error::ProviderFailure(e.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_from_le_bytes() {
        let flags = Flags::from_le_bytes([0x01, 0x00, 0x00, 0x00]);
        assert_eq!(flags, Flags::NEGOTIATE_UNICODE);
        assert!(flags.contains(Flags::NEGOTIATE_UNICODE));
        assert!(!flags.contains(Flags::NEGOTIATE_OEM));

        let flags = Flags::from_le_bytes([0x05, 0x02, 0x88, 0xA0]);
        assert!(flags.contains(Flags::NEGOTIATE_UNICODE));
        assert!(flags.contains(Flags::REQUEST_TARGET));
        assert!(flags.contains(Flags::NEGOTIATE_NTLM));
        assert!(flags.contains(Flags::NEGOTIATE_NTLM2_KEY));
        assert!(flags.contains(Flags::NEGOTIATE_TARGET_INFO));
        assert!(flags.contains(Flags::NEGOTIATE_128BIT));
        assert!(flags.contains(Flags::NEGOTIATE_56BIT));
        assert!(!flags.contains(Flags::NEGOTIATE_VERSION));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::Truncated { expected_min_len: 52, obtained_len: 12 }.kind(), ErrorKind::Truncated);
        assert_eq!(Error::NtlmRevisionMismatch { expected: 0x0F, obtained: 0x0A }.kind(), ErrorKind::InvalidMessage);
        assert_eq!(Error::UnsupportedCharset { flags: Flags::NEGOTIATE_OEM }.kind(), ErrorKind::UnsupportedCharset);
        assert_eq!(Error::ProviderFailure("nope".to_owned()).kind(), ErrorKind::ProviderFailure);
        assert_eq!(Error::NoContext.kind(), ErrorKind::NoContext);
        assert_eq!(Error::from(StoringError::NeitherUnicodeNorOem).kind(), ErrorKind::ProviderFailure);
    }
}
