//! Events reported to applications.
//!
//! Channel data is read directly with [`Session::channel_read()`](crate::Session::channel_read),
//! other activity is queued as an [`Event`] and returned by
//! [`Session::next_event()`](crate::Session::next_event).

use crate::channel::{ChanKind, ChanNum, ChanRequest, GlobalReq};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer opened a channel that the handler accepted
    ChannelOpened { num: ChanNum, kind: ChanKind },
    /// An accepted channel request, including `exit-status` on a client
    ChannelRequest { num: ChanNum, req: ChanRequest },
    /// The peer will send no more data on the channel
    Eof { num: ChanNum },
    /// The peer closed the channel and all its data has been read.
    ///
    /// The channel number remains allocated until
    /// [`Session::channel_free()`](crate::Session::channel_free).
    Close { num: ChanNum },
    /// User authentication completed. On a server `user` is the
    /// authenticated username, a client gets its own.
    Authenticated { user: String },
    /// A server's userauth banner, clients only
    Banner { message: String },
    /// An accepted global request from the peer
    GlobalRequest(GlobalReq),
}

impl Event {
    /// The channel the event relates to
    pub fn channel(&self) -> Option<ChanNum> {
        match self {
            Self::ChannelOpened { num, .. }
            | Self::ChannelRequest { num, .. }
            | Self::Eof { num }
            | Self::Close { num } => Some(*num),
            _ => None,
        }
    }
}
