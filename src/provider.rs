//! The security provider: the component that issues challenges and validates responses.
//!
//! The handshake machinery never touches a password or a hash itself; it hands the raw messages to a
//! [`SecurityProvider`]. Any implementation will do: a binding to a platform security API, a test
//! double, or the [`PasswordProvider`] shipped with this crate.


use rand::Rng;
use rand::rngs::OsRng;
use tracing::debug;

use crate::{Error, Flags};
use crate::crypto::{
    constant_time_eq, get_ntlm_time, ntlm_v1_extended_response, ntlm_v1_response, ntowf_v1,
    ntowf_v2, verify_nt_proof_v2,
};
use crate::message::{
    AuthenticateMessage, ChallengeMessage, NegotiateMessage, TargetInfoEntry, TargetInfoType,
};
use crate::os_version::OsVersion;


/// Issues NTLM challenges and validates the responses to them.
pub trait SecurityProvider: Send + Sync {
    /// Server-wide credentials, acquired once.
    type Credentials: Send + Sync;

    /// Per-handshake state, created along with a challenge and consumed by [`update`](Self::update).
    type Context: Send + Sync;

    /// Acquires the credentials the server authenticates with.
    fn acquire_server_credentials(&self) -> Result<Self::Credentials, Error>;

    /// Processes a Negotiate message, returning a fresh context and the encoded Challenge message.
    fn new_context(&self, credentials: &Self::Credentials, negotiate: &[u8]) -> Result<(Self::Context, Vec<u8>), Error>;

    /// Validates an Authenticate message against the challenge of `context`.
    ///
    /// `Ok(())` means the client proved knowledge of its credentials.
    fn update(&self, context: &mut Self::Context, authenticate: &[u8]) -> Result<(), Error>;
}


/// The flags the [`PasswordProvider`] is willing to echo back when the client asks for them.
const ECHOED_FLAGS: Flags = Flags::REQUEST_TARGET
    .union(Flags::NEGOTIATE_NTLM2_KEY)
    .union(Flags::NEGOTIATE_ALWAYS_SIGN)
    .union(Flags::NEGOTIATE_128BIT)
    .union(Flags::NEGOTIATE_56BIT);


/// The names a [`PasswordProvider`] announces in its challenges.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServerCredentials {
    /// The NetBIOS domain name, sent as the target name.
    pub target_name: String,

    /// The NetBIOS name of the server.
    pub computer_name: String,
}

/// The state of a handshake run by a [`PasswordProvider`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServerContext {
    /// The nonce sent to the client.
    pub challenge: [u8; 8],

    /// The flags sent to the client.
    pub flags: Flags,
}

/// A security provider that validates NT responses against passwords it looks up itself.
///
/// The lookup receives the username and domain as sent by the client and returns the user's
/// password, or `None` for unknown users. NTLMv2 and NTLMv1 (with or without extended session
/// security) responses are accepted; LM-only responses are not.
pub struct PasswordProvider<L> {
    target_name: String,
    computer_name: String,
    lookup: L,
}

impl<L> PasswordProvider<L>
where
    L: Fn(&str, &str) -> Option<String> + Send + Sync,
{
    pub fn new(target_name: impl Into<String>, computer_name: impl Into<String>, lookup: L) -> Self {
        Self {
            target_name: target_name.into(),
            computer_name: computer_name.into(),
            lookup,
        }
    }
}

impl<L> SecurityProvider for PasswordProvider<L>
where
    L: Fn(&str, &str) -> Option<String> + Send + Sync,
{
    type Credentials = ServerCredentials;
    type Context = ServerContext;

    fn acquire_server_credentials(&self) -> Result<Self::Credentials, Error> {
        Ok(ServerCredentials {
            target_name: self.target_name.clone(),
            computer_name: self.computer_name.clone(),
        })
    }

    fn new_context(&self, credentials: &Self::Credentials, negotiate: &[u8]) -> Result<(Self::Context, Vec<u8>), Error> {
        let negotiate = NegotiateMessage::try_from(negotiate)?;
        if !negotiate.flags.contains(Flags::NEGOTIATE_UNICODE) {
            return Err(Error::UnsupportedCharset { flags: negotiate.flags });
        }

        let mut flags = Flags::NEGOTIATE_UNICODE
            | Flags::NEGOTIATE_NTLM
            | Flags::NEGOTIATE_TARGET_INFO
            | (negotiate.flags & ECHOED_FLAGS);
        if flags.contains(Flags::REQUEST_TARGET) {
            flags |= Flags::TARGET_TYPE_DOMAIN;
        }

        let mut challenge = [0u8; 8];
        OsRng.fill(&mut challenge);

        let message = ChallengeMessage {
            target_name: credentials.target_name.clone(),
            flags,
            challenge,
            target_information: vec![
                TargetInfoEntry::from_string(TargetInfoType::NtDomain, &credentials.target_name),
                TargetInfoEntry::from_string(TargetInfoType::NtServer, &credentials.computer_name),
                TargetInfoEntry::timestamp(get_ntlm_time()),
                TargetInfoEntry::terminator(),
            ],
            os_version: OsVersion::default(),
        };
        let bytes = message.to_bytes()?;

        Ok((ServerContext { challenge, flags }, bytes))
    }

    fn update(&self, context: &mut Self::Context, authenticate: &[u8]) -> Result<(), Error> {
        let message = AuthenticateMessage::try_from(authenticate)?;
        let flags = message.flags_or(context.flags);
        let user = message.decode_user_name(flags)?;
        let domain = message.decode_target_name(flags)?;

        let password = (self.lookup)(&user, &domain)
            .ok_or_else(|| Error::ProviderFailure(format!("unknown user {:?} in domain {:?}", user, domain)))?;

        let nt_response = message.ntlm_response;
        let valid = if nt_response.len() > 24 {
            debug!("validating NTLMv2 response");
            let (proof, blob) = nt_response.split_at(16);
            verify_nt_proof_v2(ntowf_v2(&password, &user, &domain), context.challenge, blob, proof)
        } else if nt_response.len() == 24 {
            let nt_hash = ntowf_v1(&password);
            let expected = if context.flags.contains(Flags::NEGOTIATE_NTLM2_KEY) && message.lm_response.len() >= 8 {
                debug!("validating NTLMv1 response with extended session security");
                let mut client_challenge = [0u8; 8];
                client_challenge.copy_from_slice(&message.lm_response[0..8]);
                ntlm_v1_extended_response(nt_hash, context.challenge, client_challenge)
            } else {
                debug!("validating NTLMv1 response");
                ntlm_v1_response(nt_hash, context.challenge)
            };
            constant_time_eq(nt_response, &expected)
        } else {
            return Err(Error::ProviderFailure(format!("unusable NT response of {} bytes", nt_response.len())));
        };

        if valid {
            Ok(())
        } else {
            Err(Error::ProviderFailure(format!("wrong response for user {:?} in domain {:?}", user, domain)))
        }
    }
}
