//! Correlation of the stateless HTTP requests that make up an NTLM handshake.
//!
//! A handshake spans two requests: the Negotiate message, answered with a challenge, and the
//! Authenticate message, which must be checked against that very challenge. HTTP carries nothing
//! that links the two, so the coordinator keys the pending handshakes by a correlation key supplied
//! by the transport, typically the identity of the TCP connection.
//!
//! Per key, a handshake moves through the states of [`HandshakeState`]:
//!
//! ```text
//!          Negotiate             Authenticate, provider accepts
//! Idle ─────────────► Awaiting ───────────────────────────────► Resolved
//!   ▲                 Authenticate │ ▲                │
//!   │                              │ └── Negotiate ───┘ (restart)
//!   │                              │ Authenticate, anything fails
//!   │                              └───────────────────────────► Rejected
//!   └────────── timeout eviction ──┘
//! ```
//!
//! Resolved and Rejected are terminal: the pending entry is gone afterwards, so the key is back to
//! Idle and a replayed Authenticate message meets no context.


use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{Error, Flags};
use crate::message::{AuthenticateMessage, MessageType, challenge_flags, read_message_number};
use crate::provider::SecurityProvider;


/// The state of the handshake of one client.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum HandshakeState {
    /// No Negotiate message is on record.
    Idle,

    /// A challenge has been issued and the Authenticate message is due.
    AwaitingAuthenticate,

    /// The client has been authenticated.
    Resolved,

    /// The Authenticate message has been refused.
    Rejected,
}

/// The authenticated identity of a client.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Identity {
    pub user: String,

    /// The domain the client authenticated against; may be empty.
    pub domain: String,

    /// The name of the client's machine; may be empty.
    pub workstation: String,
}
impl fmt::Display for Identity {
    /// Formats the identity as `DOMAIN\user`, or as `user` if the domain is empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.user)
        } else {
            write!(f, "{}\\{}", self.domain, self.user)
        }
    }
}

/// What a message moved the handshake to.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Step {
    /// A Negotiate message was answered; the encoded Challenge message must be sent to the client.
    Challenge(Vec<u8>),

    /// An Authenticate message was accepted.
    Authenticated(Identity),
}


struct PendingHandshake<C> {
    context: C,
    challenge_flags: Flags,
    started: Instant,
}


/// Drives NTLM handshakes for any number of concurrent clients.
///
/// The pending handshakes live in a concurrent map, so one coordinator can be shared by all
/// request handlers. Calls into the security provider happen outside of any map lock.
pub struct HandshakeCoordinator<P: SecurityProvider, K> {
    provider: P,
    credentials: P::Credentials,
    pending: DashMap<K, PendingHandshake<P::Context>>,
    timeout: Duration,
    created: Instant,
    /// Nanoseconds after `created` at which the last sweep ran.
    last_sweep: AtomicU64,
}

fn nanos_u64(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl<P, K> HandshakeCoordinator<P, K>
where
    P: SecurityProvider,
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Creates a coordinator, acquiring the server credentials from `provider`.
    ///
    /// Handshakes not completed within `timeout` are forgotten.
    pub fn new(provider: P, timeout: Duration) -> Result<Self, Error> {
        let credentials = provider.acquire_server_credentials()?;
        Ok(Self {
            provider,
            credentials,
            pending: DashMap::new(),
            timeout,
            created: Instant::now(),
            last_sweep: AtomicU64::new(0),
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The number of handshakes awaiting an Authenticate message, including expired ones that have
    /// not been swept yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns the state of the handshake for `key`.
    ///
    /// Finished handshakes leave no trace, so this is either [`HandshakeState::Idle`] or
    /// [`HandshakeState::AwaitingAuthenticate`].
    pub fn state(&self, key: &K) -> HandshakeState {
        match self.pending.get(key) {
            Some(p) if !self.is_expired(&p) => HandshakeState::AwaitingAuthenticate,
            _ => HandshakeState::Idle,
        }
    }

    /// Feeds a raw NTLM message received from the client identified by `key`.
    pub fn handle(&self, key: &K, message: &[u8]) -> Result<Step, Error> {
        let number = read_message_number(message)?;
        match MessageType::from_message_number(number) {
            MessageType::Negotiate => self.negotiate(key, message).map(Step::Challenge),
            MessageType::Authenticate => self.authenticate(key, message).map(Step::Authenticated),
            MessageType::Challenge | MessageType::Unknown
                => Err(Error::UnexpectedMessageType { expected: 3, obtained: number }),
        }
    }

    /// Starts (or restarts) the handshake for `key`, returning the encoded Challenge message.
    pub fn negotiate(&self, key: &K, negotiate: &[u8]) -> Result<Vec<u8>, Error> {
        if self.claim_sweep() {
            self.evict_expired();
        }

        if self.pending.remove(key).is_some() {
            debug!(?key, "restarting NTLM handshake");
        }

        let (context, challenge) = self.provider.new_context(&self.credentials, negotiate)?;
        let challenge_flags = challenge_flags(&challenge)
            .map_err(|e| Error::ProviderFailure(format!("unreadable challenge message: {}", e)))?;

        self.pending.insert(key.clone(), PendingHandshake {
            context,
            challenge_flags,
            started: Instant::now(),
        });
        debug!(?key, state = ?HandshakeState::AwaitingAuthenticate, "issued NTLM challenge");
        Ok(challenge)
    }

    /// Completes the handshake for `key` with the client's Authenticate message.
    ///
    /// The pending context is consumed whatever the outcome.
    pub fn authenticate(&self, key: &K, authenticate: &[u8]) -> Result<Identity, Error> {
        let (_, mut pending) = self.pending.remove(key)
            .ok_or(Error::NoContext)?;
        if self.is_expired(&pending) {
            debug!(?key, "NTLM handshake expired before completion");
            return Err(Error::NoContext);
        }

        let result = self.complete(&mut pending, authenticate);
        match &result {
            Ok(identity) => debug!(?key, state = ?HandshakeState::Resolved, user = %identity, "NTLM handshake completed"),
            Err(e) => debug!(?key, state = ?HandshakeState::Rejected, kind = %e.kind(), "NTLM handshake failed"),
        }
        result
    }

    fn complete(&self, pending: &mut PendingHandshake<P::Context>, authenticate: &[u8]) -> Result<Identity, Error> {
        let message = AuthenticateMessage::try_from(authenticate)?;
        let flags = message.flags_or(pending.challenge_flags);

        self.provider.update(&mut pending.context, authenticate)?;

        Ok(Identity {
            user: message.decode_user_name(flags)?,
            domain: message.decode_target_name(flags)?,
            // informational only; an undecodable name does not undo the logon
            workstation: message.decode_workstation_name(flags).unwrap_or_default(),
        })
    }

    /// Whether half a timeout has passed since the last sweep. Only one caller gets `true` per
    /// interval.
    fn claim_sweep(&self) -> bool {
        let now = nanos_u64(self.created.elapsed());
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < nanos_u64(self.timeout / 2) {
            return false;
        }
        self.last_sweep.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }

    /// Forgets all handshakes older than the timeout, returning how many were dropped.
    ///
    /// Every shard of the map is locked in turn. [`negotiate`](Self::negotiate) calls this at most
    /// once per half timeout; servers with many idle connections may also call it periodically.
    pub fn evict_expired(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.started.elapsed() < self.timeout);
        let evicted = before.saturating_sub(self.pending.len());
        if evicted > 0 {
            trace!(evicted, "evicted expired NTLM handshakes");
        }
        evicted
    }

    fn is_expired(&self, pending: &PendingHandshake<P::Context>) -> bool {
        pending.started.elapsed() >= self.timeout
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    use crate::{NTLMSSP_MAGIC, Flags};
    use crate::field::SecurityBuffer;
    use crate::message::ChallengeMessage;
    use crate::os_version::OsVersion;

    /// Hands out challenges 1, 2, 3, ... and accepts an Authenticate message if its LM response
    /// repeats the challenge.
    struct EchoProvider {
        next: AtomicU8,
    }
    impl SecurityProvider for EchoProvider {
        type Credentials = ();
        type Context = [u8; 8];

        fn acquire_server_credentials(&self) -> Result<(), Error> {
            Ok(())
        }

        fn new_context(&self, _credentials: &(), _negotiate: &[u8]) -> Result<([u8; 8], Vec<u8>), Error> {
            let challenge = [self.next.fetch_add(1, Ordering::SeqCst); 8];
            let message = ChallengeMessage {
                target_name: String::new(),
                flags: Flags::NEGOTIATE_UNICODE,
                challenge,
                target_information: Vec::new(),
                os_version: OsVersion::default(),
            };
            Ok((challenge, message.to_bytes()?))
        }

        fn update(&self, context: &mut [u8; 8], authenticate: &[u8]) -> Result<(), Error> {
            let message = AuthenticateMessage::try_from(authenticate)?;
            if message.lm_response == &context[..] {
                Ok(())
            } else {
                Err(Error::ProviderFailure("challenge mismatch".to_owned()))
            }
        }
    }

    fn coordinator(timeout: Duration) -> HandshakeCoordinator<EchoProvider, u32> {
        HandshakeCoordinator::new(EchoProvider { next: AtomicU8::new(1) }, timeout).unwrap()
    }

    fn negotiate() -> Vec<u8> {
        let mut buf = Vec::from(NTLMSSP_MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&Flags::NEGOTIATE_UNICODE.bits().to_le_bytes());
        buf
    }

    /// A 52-byte-header Authenticate message without flags, user "bob".
    fn authenticate(echo: u8) -> Vec<u8> {
        let user: Vec<u8> = "bob".encode_utf16().flat_map(|w| w.to_le_bytes()).collect();
        let mut buf = Vec::from(NTLMSSP_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&SecurityBuffer::new(8, 52).to_bytes());
        buf.extend_from_slice(&SecurityBuffer::new(0, 60).to_bytes());
        buf.extend_from_slice(&SecurityBuffer::new(0, 60).to_bytes());
        buf.extend_from_slice(&SecurityBuffer::new(user.len() as u16, 60).to_bytes());
        buf.extend_from_slice(&SecurityBuffer::new(0, 60).to_bytes());
        buf.extend_from_slice(&[echo; 8]);
        buf.extend_from_slice(&user);
        buf
    }

    #[test]
    fn full_handshake() {
        let c = coordinator(Duration::from_secs(60));
        assert_eq!(c.state(&7), HandshakeState::Idle);

        let step = c.handle(&7, &negotiate()).unwrap();
        assert!(matches!(step, Step::Challenge(_)));
        assert_eq!(c.state(&7), HandshakeState::AwaitingAuthenticate);

        // no flags in the Authenticate message: the challenge's flags decode the user name
        let step = c.handle(&7, &authenticate(1)).unwrap();
        assert_eq!(step, Step::Authenticated(Identity { user: "bob".to_owned(), ..Identity::default() }));
        assert_eq!(c.state(&7), HandshakeState::Idle);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn authenticate_without_negotiate_is_rejected() {
        let c = coordinator(Duration::from_secs(60));
        assert_eq!(c.authenticate(&7, &authenticate(1)), Err(Error::NoContext));
    }

    #[test]
    fn replay_after_success_is_rejected() {
        let c = coordinator(Duration::from_secs(60));
        c.negotiate(&7, &negotiate()).unwrap();
        c.authenticate(&7, &authenticate(1)).unwrap();
        assert_eq!(c.authenticate(&7, &authenticate(1)), Err(Error::NoContext));
    }

    #[test]
    fn failure_consumes_the_context() {
        let c = coordinator(Duration::from_secs(60));
        c.negotiate(&7, &negotiate()).unwrap();
        assert!(matches!(c.authenticate(&7, &authenticate(9)), Err(Error::ProviderFailure(_))));
        assert_eq!(c.state(&7), HandshakeState::Idle);
        assert_eq!(c.authenticate(&7, &authenticate(1)), Err(Error::NoContext));
    }

    #[test]
    fn malformed_authenticate_consumes_the_context() {
        let c = coordinator(Duration::from_secs(60));
        c.negotiate(&7, &negotiate()).unwrap();
        let mut bad = authenticate(1);
        bad.truncate(40);
        assert!(matches!(c.authenticate(&7, &bad), Err(Error::Truncated { .. })));
        assert_eq!(c.state(&7), HandshakeState::Idle);
    }

    #[test]
    fn negotiate_restarts_the_handshake() {
        let c = coordinator(Duration::from_secs(60));
        c.negotiate(&7, &negotiate()).unwrap();
        c.negotiate(&7, &negotiate()).unwrap();
        assert_eq!(c.pending(), 1);
        // the first challenge is gone
        assert!(matches!(c.authenticate(&7, &authenticate(1)), Err(Error::ProviderFailure(_))));

        c.negotiate(&7, &negotiate()).unwrap();
        assert!(c.authenticate(&7, &authenticate(3)).is_ok());
    }

    #[test]
    fn expired_handshake_has_no_context() {
        let c = coordinator(Duration::ZERO);
        c.negotiate(&7, &negotiate()).unwrap();
        assert_eq!(c.state(&7), HandshakeState::Idle);
        assert_eq!(c.authenticate(&7, &authenticate(1)), Err(Error::NoContext));
    }

    #[test]
    fn eviction_sweeps_expired_entries() {
        let c = coordinator(Duration::ZERO);
        c.negotiate(&1, &negotiate()).unwrap();
        c.negotiate(&2, &negotiate()).unwrap();
        // with a zero timeout every Negotiate is due for a sweep
        assert_eq!(c.pending(), 1);
        assert_eq!(c.evict_expired(), 1);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let c = coordinator(Duration::from_secs(60));
        // nothing is due until half the timeout has passed
        assert!(!c.claim_sweep());

        let c = coordinator(Duration::ZERO);
        assert!(c.claim_sweep());
    }

    #[test]
    fn undecodable_workstation_does_not_refuse_the_user() {
        let c = coordinator(Duration::from_secs(60));
        c.negotiate(&7, &negotiate()).unwrap();

        // a 3-byte workstation name after the user name
        let mut msg = authenticate(1);
        msg[44..52].copy_from_slice(&SecurityBuffer::new(3, 60).to_bytes());
        let identity = c.authenticate(&7, &msg).unwrap();
        assert_eq!(identity.user, "bob");
        assert_eq!(identity.workstation, "");
    }

    #[test]
    fn interleaved_handshakes_stay_apart() {
        let c = coordinator(Duration::from_secs(60));
        c.negotiate(&1, &negotiate()).unwrap(); // challenge 1
        c.negotiate(&2, &negotiate()).unwrap(); // challenge 2

        // B's response on A's connection does not validate
        assert!(c.authenticate(&1, &authenticate(2)).is_err());
        assert_eq!(c.state(&2), HandshakeState::AwaitingAuthenticate);
        assert!(c.authenticate(&2, &authenticate(2)).is_ok());
    }

    #[test]
    fn rejects_challenge_messages_from_clients() {
        let c = coordinator(Duration::from_secs(60));
        let mut msg = negotiate();
        msg[8] = 2;
        assert_eq!(c.handle(&7, &msg), Err(Error::UnexpectedMessageType { expected: 3, obtained: 2 }));
        assert!(matches!(c.handle(&7, b"NTLM"), Err(Error::Truncated { .. })));
    }

    #[test]
    fn identity_display() {
        let mut identity = Identity { user: "alice".to_owned(), domain: String::new(), workstation: "WS".to_owned() };
        assert_eq!(identity.to_string(), "alice");
        identity.domain = "EXAMPLE".to_owned();
        assert_eq!(identity.to_string(), "EXAMPLE\\alice");
    }
}
