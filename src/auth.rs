//! Password handshake
//!
//! The host does not know the firmware generation before login, so the
//! short (V2.0) form is tried first and the paired (V3.0) form follows when
//! the device stays silent. The machine is pure: the session owns the clock
//! and the transport and reports replies and timeouts back in.

use crate::error::{AromaTechError, Result};
use crate::protocol::{encode, AuthResult, Command, LoginReply};
use crate::types::{Credential, ProtocolVersion};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Where the handshake stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing sent yet
    Idle,
    /// Login frame in the given form sent, waiting for a reply
    Sent(ProtocolVersion),
    /// Password accepted
    Authenticated,
    /// Password refused
    Rejected,
    /// Neither login form was answered
    TimedOut,
}

impl AuthState {
    /// Check if no further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Rejected | Self::TimedOut)
    }
}

/// Login state machine for one connection attempt
#[derive(Debug)]
pub struct Authenticator {
    credential: Credential,
    state: AuthState,
}

impl Authenticator {
    /// Create an idle authenticator
    #[must_use]
    pub const fn new(credential: Credential) -> Self {
        Self {
            credential,
            state: AuthState::Idle,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Begin the handshake, returning the first login frame
    ///
    /// `None` if the handshake was already started.
    pub fn start(&mut self) -> Option<Bytes> {
        if self.state != AuthState::Idle {
            return None;
        }
        Some(self.send(ProtocolVersion::V2))
    }

    /// The pending login form went unanswered
    ///
    /// Returns the next form to send, or `None` once both forms are exhausted
    /// and the machine has timed out.
    pub fn on_timeout(&mut self) -> Option<Bytes> {
        match self.state {
            AuthState::Sent(ProtocolVersion::V2) => {
                debug!("No reply to short login, retrying with pairing code");
                Some(self.send(ProtocolVersion::V3))
            }
            AuthState::Sent(ProtocolVersion::V3) => {
                warn!("Device did not answer either login form");
                self.state = AuthState::TimedOut;
                None
            }
            _ => None,
        }
    }

    /// Feed a login reply; replies outside [`AuthState::Sent`] are ignored
    pub fn on_reply(&mut self, reply: &LoginReply) -> AuthState {
        if let AuthState::Sent(_) = self.state {
            self.state = match reply.result {
                AuthResult::Success => {
                    info!("Login accepted");
                    AuthState::Authenticated
                }
                AuthResult::Failure => {
                    warn!("Login rejected, check the device password");
                    AuthState::Rejected
                }
            };
        }
        self.state
    }

    /// Outcome of a finished handshake
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::AuthenticationRejected`] or
    /// [`AromaTechError::AuthenticationTimeout`] for the failed terminal
    /// states, and [`AromaTechError::Protocol`] if the handshake is unfinished.
    pub fn outcome(&self, timeout_ms: u64) -> Result<()> {
        match self.state {
            AuthState::Authenticated => Ok(()),
            AuthState::Rejected => Err(AromaTechError::AuthenticationRejected),
            AuthState::TimedOut => Err(AromaTechError::AuthenticationTimeout { timeout_ms }),
            AuthState::Idle | AuthState::Sent(_) => Err(AromaTechError::Protocol(
                "authentication still in progress".to_string(),
            )),
        }
    }

    fn send(&mut self, form: ProtocolVersion) -> Bytes {
        self.state = AuthState::Sent(form);
        encode(&Command::Authenticate(self.credential.clone()), form)
            .into_iter()
            .next()
            .map(|frame| frame.bytes)
            .unwrap_or_default()
    }
}
