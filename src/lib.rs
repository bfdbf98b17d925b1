//! A SSH protocol library.
//!
//! Client and server sessions run over any [`Transport`], typically a
//! [`TcpTransport`]. [`initialize()`] must be called before a [`Session`]
//! is created.

#![forbid(unsafe_code)]

// avoids headscratching
#![deny(unused_must_use)]

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
// exported so that error variants can be matched on
pub mod error;
pub mod crypto;

mod auth;
mod behaviour;
mod buffer;
mod channel;
mod cliauth;
mod client;
mod compress;
mod conn;
mod dh;
mod encrypt;
mod event;
mod ident;
mod init;
mod kex;
mod namelist;
mod random;
mod rustcrypto;
mod servauth;
mod server;
mod session;
mod sign;
mod ssh_chapoly;
mod sshlog;
mod termmodes;
mod traffic;
mod transport;

// Application API
pub use sshwire::TextString;

pub use session::Session;
pub use conn::SessionState;
pub use event::Event;
pub use transport::{mem_pair, MemTransport, TcpTransport, Transport};
pub use init::{initialize, is_initialized, shutdown};

pub use client::{AcceptAnyHostkey, ClientHandler};
pub use server::ServerHandler;
pub use auth::{AuthDecision, AuthMethods, AuthResult, KbdIntChallenge, KbdIntPrompt, KbdIntReply};

pub use channel::{
    ChanData, ChanKind, ChanNum, ChanOpened, ChanReady, ChanRequest, ExitSignal, GlobalReply,
    GlobalReq, Pty, ReqId,
};
pub use termmodes::{ModePair, TermModes};

pub use config::SshConfig;
pub use error::{Error, Result};
pub use sign::{KeyPair, PubKey, SignKey};
pub use crypto::{default_provider, CryptoProvider};
pub use kex::Negotiated;
pub use sshnames::{ChanFail, DisconnectReason};
