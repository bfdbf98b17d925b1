//! Client application callbacks.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::channel::{ChanKind, ChanNum, ChanOpened, ChanRequest, GlobalReply, GlobalReq};
use crate::sshnames::ChanFail;

/// Decisions a client application makes while the session runs.
///
/// Authentication is driven by calls on the
/// [`Session`](crate::Session) rather than by callbacks.
pub trait ClientHandler: Send {
    /// Checks the server's host key blob, in SSH wire format.
    ///
    /// Called on every key exchange, the session also rejects a host key
    /// that changes on a rekey. Return `false` to reject it.
    fn check_hostkey(&mut self, hostkey: &[u8]) -> bool;

    /// The server opened a channel, such as a `forwarded-tcpip` connection.
    fn open_channel(&mut self, num: ChanNum, kind: &ChanKind) -> ChanOpened {
        debug!("Refusing server channel {num} {kind:?}");
        ChanOpened::Failure(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED)
    }

    /// A request on a channel. `exit-status` and `exit-signal` are
    /// recorded by the session without calling this.
    #[allow(unused_variables)]
    fn channel_request(&mut self, num: ChanNum, req: &ChanRequest) -> bool {
        false
    }

    #[allow(unused_variables)]
    fn global_request(&mut self, req: &GlobalReq) -> GlobalReply {
        GlobalReply::Failure
    }
}

/// Accepts any host key. Intended for tests, it provides no protection
/// against an active attacker.
pub struct AcceptAnyHostkey;

impl ClientHandler for AcceptAnyHostkey {
    fn check_hostkey(&mut self, hostkey: &[u8]) -> bool {
        warn!("Accepting unverified host key, {} bytes", hostkey.len());
        true
    }
}
