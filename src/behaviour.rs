#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::channel::{ChanKind, ChanNum, ChanOpened, ChanRequest, GlobalReply, GlobalReq};
use crate::client::ClientHandler;
use crate::server::ServerHandler;

/// Either client or server application behaviour, for code shared by both
pub(crate) enum Behaviour<'a> {
    Client(&'a mut dyn ClientHandler),
    Server(&'a mut dyn ServerHandler),
}

impl Behaviour<'_> {
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    pub fn open_channel(&mut self, num: ChanNum, kind: &ChanKind) -> ChanOpened {
        match self {
            Self::Client(c) => c.open_channel(num, kind),
            Self::Server(s) => s.open_channel(num, kind),
        }
    }

    pub fn channel_request(&mut self, num: ChanNum, req: &ChanRequest) -> bool {
        match self {
            Self::Client(c) => c.channel_request(num, req),
            Self::Server(s) => s.channel_request(num, req),
        }
    }

    pub fn global_request(&mut self, req: &GlobalReq) -> GlobalReply {
        match self {
            Self::Client(c) => c.global_request(req),
            Self::Server(s) => s.global_request(req),
        }
    }
}
