//! Server application callbacks.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::auth::{AuthDecision, AuthMethods, KbdIntReply};
use crate::channel::{ChanKind, ChanNum, ChanOpened, ChanRequest, GlobalReply, GlobalReq};
use crate::sshnames::ChanFail;

/// Decisions a server application makes while the session runs.
///
/// Each method has a default that refuses, apart from opening session channels.
pub trait ServerHandler: Send {
    /// Methods offered to `user`, listed in USERAUTH_FAILURE replies.
    /// A method absent from this set is refused without asking.
    #[allow(unused_variables)]
    fn auth_methods(&mut self, user: &str) -> AuthMethods {
        AuthMethods::PASSWORD | AuthMethods::PUBLICKEY
    }

    /// A banner sent once, before the first authentication reply.
    #[allow(unused_variables)]
    fn auth_banner(&mut self, user: &str) -> Option<String> {
        None
    }

    /// The `none` method, accepting allows login without credentials
    #[allow(unused_variables)]
    fn auth_none(&mut self, user: &str) -> AuthDecision {
        AuthDecision::Deny
    }

    #[allow(unused_variables)]
    fn auth_password(&mut self, user: &str, password: &str) -> AuthDecision {
        AuthDecision::Deny
    }

    /// Whether a public key would be accepted for `user`. Used for a
    /// query without a signature.
    #[allow(unused_variables)]
    fn auth_pubkey_acceptable(&mut self, user: &str, algo: &str, pubkey: &[u8]) -> bool {
        false
    }

    /// A public key with a valid signature. The signature has already
    /// been checked.
    fn auth_pubkey(&mut self, user: &str, algo: &str, pubkey: &[u8]) -> AuthDecision {
        if self.auth_pubkey_acceptable(user, algo, pubkey) {
            AuthDecision::Accept
        } else {
            AuthDecision::Deny
        }
    }

    /// Start of keyboard-interactive authentication.
    #[allow(unused_variables)]
    fn auth_kbdint(&mut self, user: &str, submethods: &str) -> KbdIntReply {
        KbdIntReply::Decision(AuthDecision::Deny)
    }

    /// Responses to the previous round of prompts, in prompt order.
    #[allow(unused_variables)]
    fn auth_kbdint_response(&mut self, user: &str, responses: &[String]) -> KbdIntReply {
        KbdIntReply::Decision(AuthDecision::Deny)
    }

    /// A client opened a channel. Only `session` is accepted by default.
    #[allow(unused_variables)]
    fn open_channel(&mut self, num: ChanNum, kind: &ChanKind) -> ChanOpened {
        match kind {
            ChanKind::Session => ChanOpened::Success,
            _ => ChanOpened::Failure(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED),
        }
    }

    /// A request on a channel, `true` to accept. Accepted requests are
    /// also reported as [`Event::ChannelRequest`](crate::Event::ChannelRequest).
    #[allow(unused_variables)]
    fn channel_request(&mut self, num: ChanNum, req: &ChanRequest) -> bool {
        false
    }

    #[allow(unused_variables)]
    fn global_request(&mut self, req: &GlobalReq) -> GlobalReply {
        GlobalReply::Failure
    }
}
