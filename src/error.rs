use core::str::Utf8Error;
#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;

use snafu::prelude::*;

use crate::channel::ChanNum;

/// The crate error type.
///
/// Errors fall into three groups. Fatal errors (integrity, framing, protocol
/// violations, peer disconnect, transport failure) mark the [`Session`](crate::Session)
/// closed; every later call then fails with [`Error::SessionClosed`].
/// Request-scoped errors (a refused channel open or request, an unknown
/// channel) leave the session usable. Usage errors indicate the caller
/// did something invalid.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    #[snafu(display("Invalid packet"))]
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Key exchange incorrect
    BadKex,

    /// Packet integrity failed.
    // Deliberately shares its message with other packet rejections.
    #[snafu(display("Invalid packet"))]
    BadDecrypt,

    /// Signature is incorrect
    #[snafu(display("Invalid packet"))]
    BadSig,

    /// Integer overflow in packet
    BadNumber,

    /// Error in received SSH protocol. Will disconnect.
    SSHProtoError,

    /// Peer sent something we don't handle. Will disconnect.
    ///
    /// This differs to `SSHProtoError`. In this case the peer may be
    /// behaved within the SSH specifications, but we don't support it.
    SSHProtoUnsupported,

    /// Remote peer isn't SSH
    NotSSH,

    /// Remote peer speaks an unsupported SSH protocol version
    #[snafu(display("Unsupported SSH protocol version {version}"))]
    ProtocolVersion { version: String },

    /// Bad key format
    BadKey,

    #[snafu(display("Bad channel number {num}"))]
    BadChannel { num: ChanNum },

    /// Bad application usage
    ///
    /// Returned from an API call when the API is used incorrectly, for
    /// example reading from a channel that has not finished opening.
    #[snafu(display("Bad usage: {msg}"))]
    BadUsage { msg: &'static str },

    /// SSH packet contents doesn't match length
    #[snafu(display("Invalid packet"))]
    WrongPacketLength,

    /// Channel EOF
    ///
    /// This is an expected error when a SSH channel completes. Can be returned
    /// by channel write functions after EOF or close.
    ChannelEOF,

    /// The peer refused to open a channel
    #[snafu(display("Channel open failed ({reason}): {desc}"))]
    ChannelOpenFailed { reason: u32, desc: String },

    /// The peer replied FAILURE to a channel or global request
    #[snafu(display("Request {what} denied"))]
    RequestDenied { what: &'static str },

    /// No usable authentication methods remain
    NoAuthMethods,

    /// The host key was rejected by the application
    HostKeyRejected,

    // Used for unknown key types etc.
    #[snafu(display("{what} is not available"))]
    NotAvailable { what: &'static str },

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Received packet at a disallowed time.
    #[snafu(display("Invalid packet"))]
    PacketWrong,

    #[snafu(display("No matching {algo} algorithm"))]
    AlgoNoMatch { algo: &'static str },

    #[snafu(display("Packet size {size} too large (or bad decrypt)"))]
    BigPacket { size: usize },

    /// An unknown SSH name is provided, for a key type, signature type,
    /// channel name etc.
    #[snafu(display("Unknown {kind} method"))]
    UnknownMethod { kind: &'static str },

    /// Compression or decompression failed, or exceeded the packet limit
    Compression,

    /// The peer sent SSH_MSG_DISCONNECT
    #[snafu(display("Peer disconnected ({reason}): {desc}"))]
    PeerDisconnect { reason: u32, desc: String },

    /// The session has been closed, following a fatal error or disconnect
    SessionClosed,

    /// [`initialize()`](crate::initialize) has not been called
    NotInitialized,

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    /// IO Error
    #[snafu(display("IO error: {source}"))]
    IoError { source: std::io::Error },

    // This state should not be reached, previous logic should have prevented it.
    // Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    /// Program bug
    Bug,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `debug` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            debug!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    #[cold]
    pub fn bug_err_msg(msg: &str) -> Error {
        Self::bug_fmt(format_args!("{}", msg))
    }

    /// Whether the error terminates the session.
    ///
    /// Request-scoped and usage errors return `false`.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::BadChannel { .. }
                | Error::BadUsage { .. }
                | Error::ChannelEOF
                | Error::ChannelOpenFailed { .. }
                | Error::RequestDenied { .. }
                | Error::NoAuthMethods
                | Error::NotAvailable { .. }
                | Error::NotInitialized
                | Error::UnknownMethod { .. }
        )
    }
}

/// A crate-specific Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message, calls [`Error::bug_msg()`]
    /// The message can be used instead of a comment.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: value }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::error::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn integrity_messages_match() {
        init_test_log();
        // MAC and signature failures must not be told apart from a malformed packet
        let generic = Error::PacketWrong.to_string();
        assert_eq!(Error::BadDecrypt.to_string(), generic);
        assert_eq!(Error::BadSig.to_string(), generic);
        assert_eq!(Error::WrongPacketLength.to_string(), generic);
    }

    #[test]
    fn fatal_classes() {
        assert!(Error::BadDecrypt.is_fatal());
        assert!(Error::PeerDisconnect { reason: 11, desc: "bye".into() }.is_fatal());
        assert!(!Error::RequestDenied { what: "exec" }.is_fatal());
        assert!(!Error::ChannelOpenFailed { reason: 1, desc: String::new() }.is_fatal());
        assert!(!Error::BadChannel { num: ChanNum(3) }.is_fatal());
    }
}
