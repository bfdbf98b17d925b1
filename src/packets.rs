//! SSH protocol packets.
//!
//! A [`Packet`] can be encoded/decoded to the
//! SSH Binary Packet Protocol using [`sshwire`](crate::sshwire).
//! SSH packet format is described in [RFC4253](https://tools.ietf.org/html/rfc4253) SSH Transport

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use crate::auth::AuthType;
use crate::config::KBDINT_MAX_PROMPTS;
use crate::namelist::NameList;
use crate::sshnames::*;
use crate::sshwire::{try_as_ascii_str, BinString, TextString};
use crate::sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireError, WireResult};
use crate::sshwire::{SSHDecodeEnum, SSHEncodeEnum};

/// Defines a struct with every field encoded in order.
macro_rules! wire_struct {
    (
        $(#[$m:meta])*
        pub struct $name:ident<$lt:lifetime> {
            $( $(#[$fm:meta])* pub $f:ident : $t:ty ),* $(,)?
        }
    ) => {
        $(#[$m])*
        pub struct $name<$lt> {
            $( $(#[$fm])* pub $f: $t ),*
        }

        impl SSHEncode for $name<'_> {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where S: SSHSink {
                $( self.$f.enc(s)?; )*
                Ok(())
            }
        }

        impl<$lt> SSHDecode<$lt> for $name<$lt> {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where S: SSHSource<$lt> {
                Ok(Self {
                    $( $f: SSHDecode::dec(s)?, )*
                })
            }
        }
    };

    (
        $(#[$m:meta])*
        pub struct $name:ident {
            $( $(#[$fm:meta])* pub $f:ident : $t:ty ),* $(,)?
        }
    ) => {
        $(#[$m])*
        pub struct $name {
            $( $(#[$fm])* pub $f: $t ),*
        }

        impl SSHEncode for $name {
            #[allow(unused_variables)]
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where S: SSHSink {
                $( self.$f.enc(s)?; )*
                Ok(())
            }
        }

        impl<'de> SSHDecode<'de> for $name {
            #[allow(unused_variables)]
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where S: SSHSource<'de> {
                Ok(Self {
                    $( $f: SSHDecode::dec(s)?, )*
                })
            }
        }
    };
}

/// Marks the packet as partially parsed, returning an `Unknown`
fn dec_unknown<'a, S: SSHSource<'a>>(s: &mut S, var: &'a [u8]) -> Unknown<'a> {
    s.ctx().seen_unknown = true;
    Unknown(var)
}

wire_struct! {
#[derive(Debug)]
pub struct KexInit<'a> {
    pub cookie: [u8; 16],
    pub kex: NameList<'a>,
    /// A list of signature algorithms
    ///
    /// RFC4253 refers to this as the host key algorithms, but actually they
    /// are signature algorithms.
    pub hostsig: NameList<'a>,
    pub cipher_c2s: NameList<'a>,
    pub cipher_s2c: NameList<'a>,
    pub mac_c2s: NameList<'a>,
    pub mac_s2c: NameList<'a>,
    pub comp_c2s: NameList<'a>,
    pub comp_s2c: NameList<'a>,
    pub lang_c2s: NameList<'a>,
    pub lang_s2c: NameList<'a>,
    pub first_follows: bool,
    pub reserved: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct NewKeys {}
}

wire_struct! {
#[derive(Debug)]
pub struct Ignore<'a> {
    pub data: BinString<'a>,
}
}

wire_struct! {
/// Named to avoid clashing with [`fmt::Debug`]
#[derive(Debug)]
pub struct DebugPacket<'a> {
    pub always_display: bool,
    pub message: TextString<'a>,
    pub lang: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Disconnect<'a> {
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: TextString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Unimplemented {
    pub seq: u32,
}
}

wire_struct! {
/// Client's ephemeral public value. For finite field DH this is the
/// mpint encoded `e`.
#[derive(Debug)]
pub struct KexDHInit<'a> {
    pub q_c: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct KexDHReply<'a> {
    /// Server host key blob
    pub k_s: BinString<'a>,
    pub q_s: BinString<'a>,
    /// Signature blob, `string algorithm || string signature`
    pub sig: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ServiceRequest<'a> {
    pub name: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ServiceAccept<'a> {
    pub name: &'a str,
}
}

#[derive(Debug)]
pub struct UserauthRequest<'a> {
    pub username: TextString<'a>,
    pub service: &'a str,
    pub method: AuthMethod<'a>,
}

impl SSHEncode for UserauthRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.username.enc(s)?;
        self.service.enc(s)?;
        self.method.variant_name()?.enc(s)?;
        self.method.enc(s)
    }
}

impl<'a> SSHDecode<'a> for UserauthRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let username = SSHDecode::dec(s)?;
        let service = SSHDecode::dec(s)?;
        let var = BinString::dec(s)?.0;
        let method = AuthMethod::dec_enum(s, var)?;
        Ok(Self { username, service, method })
    }
}

/// The method-specific part of a [`UserauthRequest`].
#[derive(Debug)]
pub enum AuthMethod<'a> {
    None,
    Password(MethodPassword<'a>),
    PubKey(MethodPubKey<'a>),
    KbdInt(MethodKbdInt<'a>),
    Unknown(Unknown<'a>),
}

impl SSHEncodeEnum for AuthMethod<'_> {
    fn variant_name(&self) -> WireResult<&'static str> {
        Ok(match self {
            AuthMethod::None => SSH_AUTHMETHOD_NONE,
            AuthMethod::Password(_) => SSH_AUTHMETHOD_PASSWORD,
            AuthMethod::PubKey(_) => SSH_AUTHMETHOD_PUBLICKEY,
            AuthMethod::KbdInt(_) => SSH_AUTHMETHOD_INTERACTIVE,
            AuthMethod::Unknown(_) => return Err(WireError::UnknownVariant),
        })
    }
}

impl SSHEncode for AuthMethod<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            AuthMethod::None => Ok(()),
            AuthMethod::Password(m) => m.enc(s),
            AuthMethod::PubKey(m) => m.enc(s),
            AuthMethod::KbdInt(m) => m.enc(s),
            AuthMethod::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecodeEnum<'a> for AuthMethod<'a> {
    fn dec_enum<S>(s: &mut S, var: &'a [u8]) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(match try_as_ascii_str(var).unwrap_or_default() {
            SSH_AUTHMETHOD_NONE => AuthMethod::None,
            SSH_AUTHMETHOD_PASSWORD => AuthMethod::Password(SSHDecode::dec(s)?),
            SSH_AUTHMETHOD_PUBLICKEY => AuthMethod::PubKey(SSHDecode::dec(s)?),
            SSH_AUTHMETHOD_INTERACTIVE => AuthMethod::KbdInt(SSHDecode::dec(s)?),
            _ => AuthMethod::Unknown(dec_unknown(s, var)),
        })
    }
}

pub struct MethodPassword<'a> {
    pub password: TextString<'a>,
    /// A new password, for a change request
    pub new: Option<TextString<'a>>,
}

// Don't print password
impl fmt::Debug for MethodPassword<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodPassword")
            .field("change", &self.new.is_some())
            .finish_non_exhaustive()
    }
}

impl SSHEncode for MethodPassword<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.new.is_some().enc(s)?;
        self.password.enc(s)?;
        self.new.enc(s)
    }
}

impl<'a> SSHDecode<'a> for MethodPassword<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let change = bool::dec(s)?;
        let password = SSHDecode::dec(s)?;
        let new = if change { Some(SSHDecode::dec(s)?) } else { None };
        Ok(Self { password, new })
    }
}

#[derive(Debug)]
pub struct MethodPubKey<'a> {
    /// A signature algorithm name (not key algorithm name).
    pub sig_algo: &'a str,
    /// Public key blob
    pub pubkey: BinString<'a>,
    /// Signature blob, `string algorithm || string signature`
    pub sig: Option<BinString<'a>>,
    /// Encodes the signature flag as TRUE even without a signature,
    /// used when building the data to be signed.
    pub force_sig: bool,
}

impl SSHEncode for MethodPubKey<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        // byte      SSH_MSG_USERAUTH_REQUEST
        // string    user name
        // string    service name
        // string    "publickey"
        // boolean   TRUE
        // string    public key algorithm name
        // string    public key to be used for authentication
        // string    signature
        let sig = self.sig.is_some() || self.force_sig;
        sig.enc(s)?;
        self.sig_algo.enc(s)?;
        self.pubkey.enc(s)?;
        self.sig.enc(s)?;
        Ok(())
    }
}

impl<'a> SSHDecode<'a> for MethodPubKey<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let sig = bool::dec(s)?;
        let sig_algo = SSHDecode::dec(s)?;
        let pubkey = SSHDecode::dec(s)?;
        let sig = if sig { Some(SSHDecode::dec(s)?) } else { None };
        Ok(Self { sig_algo, pubkey, sig, force_sig: false })
    }
}

wire_struct! {
/// [RFC4256](https://tools.ietf.org/html/rfc4256) keyboard-interactive request
#[derive(Debug)]
pub struct MethodKbdInt<'a> {
    pub lang: &'a str,
    pub submethods: TextString<'a>,
}
}

/// Message number 60 is shared by several auth methods, the
/// client decodes based on the method it last tried.
#[derive(Debug)]
pub enum Userauth60<'a> {
    PkOk(UserauthPkOk<'a>),
    PwChangeReq(UserauthPwChangeReq<'a>),
    InfoRequest(UserauthInfoRequest<'a>),
}

impl SSHEncode for Userauth60<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            Userauth60::PkOk(p) => p.enc(s),
            Userauth60::PwChangeReq(p) => p.enc(s),
            Userauth60::InfoRequest(p) => p.enc(s),
        }
    }
}

impl<'a> SSHDecode<'a> for Userauth60<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        match s.ctx().cli_auth_type {
            Some(AuthType::Password) => Ok(Self::PwChangeReq(SSHDecode::dec(s)?)),
            Some(AuthType::PubKey) => Ok(Self::PkOk(SSHDecode::dec(s)?)),
            Some(AuthType::KbdInt) => Ok(Self::InfoRequest(SSHDecode::dec(s)?)),
            _ => {
                trace!("Wrong packet state for userauth60");
                Err(WireError::PacketWrong)
            }
        }
    }
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthPkOk<'a> {
    pub algo: &'a str,
    pub key: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthPwChangeReq<'a> {
    pub prompt: TextString<'a>,
    pub lang: TextString<'a>,
}
}

#[derive(Debug)]
pub struct UserauthInfoRequest<'a> {
    pub name: TextString<'a>,
    pub instruction: TextString<'a>,
    pub lang: &'a str,
    pub prompts: Vec<InfoPrompt<'a>>,
}

wire_struct! {
#[derive(Debug, Clone, Copy)]
pub struct InfoPrompt<'a> {
    pub prompt: TextString<'a>,
    pub echo: bool,
}
}

/// Encodes a `u32` count followed by the items
fn enc_counted<T: SSHEncode, S: SSHSink>(items: &[T], s: &mut S) -> WireResult<()> {
    let n: u32 = items.len().try_into().map_err(|_| WireError::NoRoom)?;
    n.enc(s)?;
    for i in items {
        i.enc(s)?;
    }
    Ok(())
}

/// Decodes a `u32` count followed by at most `KBDINT_MAX_PROMPTS` items
fn dec_counted<'a, T: SSHDecode<'a>, S: SSHSource<'a>>(s: &mut S) -> WireResult<Vec<T>> {
    let n = u32::dec(s)? as usize;
    if n > KBDINT_MAX_PROMPTS {
        debug!("Too many kbdint prompts {n}");
        return Err(WireError::TooMany);
    }
    (0..n).map(|_| T::dec(s)).collect()
}

impl SSHEncode for UserauthInfoRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.name.enc(s)?;
        self.instruction.enc(s)?;
        self.lang.enc(s)?;
        enc_counted(&self.prompts, s)
    }
}

impl<'a> SSHDecode<'a> for UserauthInfoRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(Self {
            name: SSHDecode::dec(s)?,
            instruction: SSHDecode::dec(s)?,
            lang: SSHDecode::dec(s)?,
            prompts: dec_counted(s)?,
        })
    }
}

pub struct UserauthInfoResponse<'a> {
    pub responses: Vec<TextString<'a>>,
}

// Don't print responses
impl fmt::Debug for UserauthInfoResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserauthInfoResponse")
            .field("count", &self.responses.len())
            .finish_non_exhaustive()
    }
}

impl SSHEncode for UserauthInfoResponse<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        enc_counted(&self.responses, s)
    }
}

impl<'a> SSHDecode<'a> for UserauthInfoResponse<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(Self { responses: dec_counted(s)? })
    }
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthFailure<'a> {
    pub methods: NameList<'a>,
    pub partial: bool,
}
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthSuccess {}
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthBanner<'a> {
    pub message: TextString<'a>,
    pub lang: TextString<'a>,
}
}

#[derive(Debug)]
pub struct GlobalRequest<'a> {
    pub want_reply: bool,
    pub req: GlobalRequestMethod<'a>,
}

impl SSHEncode for GlobalRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.req.variant_name()?.enc(s)?;
        self.want_reply.enc(s)?;
        self.req.enc(s)
    }
}

impl<'a> SSHDecode<'a> for GlobalRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let var = BinString::dec(s)?.0;
        let want_reply = bool::dec(s)?;
        let req = GlobalRequestMethod::dec_enum(s, var)?;
        Ok(Self { want_reply, req })
    }
}

#[derive(Debug)]
pub enum GlobalRequestMethod<'a> {
    TcpipForward(TcpipForward<'a>),
    CancelTcpipForward(TcpipForward<'a>),
    KeepAlive,
    Unknown(Unknown<'a>),
}

impl SSHEncodeEnum for GlobalRequestMethod<'_> {
    fn variant_name(&self) -> WireResult<&'static str> {
        Ok(match self {
            Self::TcpipForward(_) => "tcpip-forward",
            Self::CancelTcpipForward(_) => "cancel-tcpip-forward",
            Self::KeepAlive => SSH_REQ_KEEPALIVE,
            Self::Unknown(_) => return Err(WireError::UnknownVariant),
        })
    }
}

impl SSHEncode for GlobalRequestMethod<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            Self::TcpipForward(t) | Self::CancelTcpipForward(t) => t.enc(s),
            Self::KeepAlive => Ok(()),
            Self::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecodeEnum<'a> for GlobalRequestMethod<'a> {
    fn dec_enum<S>(s: &mut S, var: &'a [u8]) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(match var {
            b"tcpip-forward" => Self::TcpipForward(SSHDecode::dec(s)?),
            b"cancel-tcpip-forward" => Self::CancelTcpipForward(SSHDecode::dec(s)?),
            b"keepalive@openssh.com" => Self::KeepAlive,
            _ => Self::Unknown(dec_unknown(s, var)),
        })
    }
}

wire_struct! {
#[derive(Debug, Clone)]
pub struct TcpipForward<'a> {
    pub address: TextString<'a>,
    pub port: u32,
}
}

/// Reply to a global request.
///
/// A `tcpip-forward` request for port 0 gets the bound port back.
#[derive(Debug)]
pub struct RequestSuccess {
    pub bound_port: Option<u32>,
}

impl SSHEncode for RequestSuccess {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.bound_port.enc(s)
    }
}

impl<'de> SSHDecode<'de> for RequestSuccess {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        // Response data is request-specific, only a bare port is understood
        let rest = s.take(s.remaining())?;
        let bound_port = match rest {
            [a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        };
        Ok(Self { bound_port })
    }
}

wire_struct! {
#[derive(Debug)]
pub struct RequestFailure {}
}

#[derive(Debug)]
pub struct ChannelOpen<'a> {
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub ty: ChannelOpenType<'a>,
}

impl SSHEncode for ChannelOpen<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.ty.variant_name()?.enc(s)?;
        self.num.enc(s)?;
        self.initial_window.enc(s)?;
        self.max_packet.enc(s)?;
        self.ty.enc(s)
    }
}

impl<'a> SSHDecode<'a> for ChannelOpen<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let var = BinString::dec(s)?.0;
        let num = u32::dec(s)?;
        let initial_window = u32::dec(s)?;
        let max_packet = u32::dec(s)?;
        let ty = ChannelOpenType::dec_enum(s, var)?;
        Ok(Self { num, initial_window, max_packet, ty })
    }
}

#[derive(Debug)]
pub enum ChannelOpenType<'a> {
    Session,
    DirectTcpip(DirectTcpip<'a>),
    ForwardedTcpip(ForwardedTcpip<'a>),
    X11(X11Open<'a>),
    Unknown(Unknown<'a>),
}

impl SSHEncodeEnum for ChannelOpenType<'_> {
    fn variant_name(&self) -> WireResult<&'static str> {
        Ok(match self {
            Self::Session => "session",
            Self::DirectTcpip(_) => "direct-tcpip",
            Self::ForwardedTcpip(_) => "forwarded-tcpip",
            Self::X11(_) => "x11",
            Self::Unknown(_) => return Err(WireError::UnknownVariant),
        })
    }
}

impl SSHEncode for ChannelOpenType<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            Self::Session => Ok(()),
            Self::DirectTcpip(t) => t.enc(s),
            Self::ForwardedTcpip(t) => t.enc(s),
            Self::X11(t) => t.enc(s),
            Self::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecodeEnum<'a> for ChannelOpenType<'a> {
    fn dec_enum<S>(s: &mut S, var: &'a [u8]) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(match var {
            b"session" => Self::Session,
            b"direct-tcpip" => Self::DirectTcpip(SSHDecode::dec(s)?),
            b"forwarded-tcpip" => Self::ForwardedTcpip(SSHDecode::dec(s)?),
            b"x11" => Self::X11(SSHDecode::dec(s)?),
            _ => Self::Unknown(dec_unknown(s, var)),
        })
    }
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelOpenFailure<'a> {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelData<'a> {
    pub num: u32,
    pub data: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelDataExt<'a> {
    pub num: u32,
    pub code: u32,
    pub data: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelEof {
    pub num: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelClose {
    pub num: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelSuccess {
    pub num: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelFailure {
    pub num: u32,
}
}

#[derive(Debug)]
pub struct ChannelRequest<'a> {
    pub num: u32,
    pub want_reply: bool,
    pub req: ChannelReqType<'a>,
}

impl SSHEncode for ChannelRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.num.enc(s)?;
        self.req.variant_name()?.enc(s)?;
        self.want_reply.enc(s)?;
        self.req.enc(s)
    }
}

impl<'a> SSHDecode<'a> for ChannelRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let num = u32::dec(s)?;
        let var = BinString::dec(s)?.0;
        let want_reply = bool::dec(s)?;
        let req = ChannelReqType::dec_enum(s, var)?;
        Ok(Self { num, want_reply, req })
    }
}

#[derive(Debug)]
pub enum ChannelReqType<'a> {
    Pty(PtyReq<'a>),
    Shell,
    Exec(Exec<'a>),
    Subsystem(Subsystem<'a>),
    Env(Env<'a>),
    WinChange(WinChange),
    Signal(Signal<'a>),
    ExitStatus(ExitStatus),
    ExitSignal(ExitSignal<'a>),
    Break(Break),
    X11Req(X11Req<'a>),
    KeepAlive,
    Unknown(Unknown<'a>),
}

impl SSHEncodeEnum for ChannelReqType<'_> {
    fn variant_name(&self) -> WireResult<&'static str> {
        Ok(match self {
            Self::Pty(_) => "pty-req",
            Self::Shell => "shell",
            Self::Exec(_) => "exec",
            Self::Subsystem(_) => "subsystem",
            Self::Env(_) => "env",
            Self::WinChange(_) => "window-change",
            Self::Signal(_) => "signal",
            Self::ExitStatus(_) => "exit-status",
            Self::ExitSignal(_) => "exit-signal",
            Self::Break(_) => "break",
            Self::X11Req(_) => "x11-req",
            Self::KeepAlive => SSH_REQ_KEEPALIVE,
            Self::Unknown(_) => return Err(WireError::UnknownVariant),
        })
    }
}

impl SSHEncode for ChannelReqType<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            Self::Pty(r) => r.enc(s),
            Self::Shell | Self::KeepAlive => Ok(()),
            Self::Exec(r) => r.enc(s),
            Self::Subsystem(r) => r.enc(s),
            Self::Env(r) => r.enc(s),
            Self::WinChange(r) => r.enc(s),
            Self::Signal(r) => r.enc(s),
            Self::ExitStatus(r) => r.enc(s),
            Self::ExitSignal(r) => r.enc(s),
            Self::Break(r) => r.enc(s),
            Self::X11Req(r) => r.enc(s),
            Self::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecodeEnum<'a> for ChannelReqType<'a> {
    fn dec_enum<S>(s: &mut S, var: &'a [u8]) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(match var {
            b"pty-req" => Self::Pty(SSHDecode::dec(s)?),
            b"shell" => Self::Shell,
            b"exec" => Self::Exec(SSHDecode::dec(s)?),
            b"subsystem" => Self::Subsystem(SSHDecode::dec(s)?),
            b"env" => Self::Env(SSHDecode::dec(s)?),
            b"window-change" => Self::WinChange(SSHDecode::dec(s)?),
            b"signal" => Self::Signal(SSHDecode::dec(s)?),
            b"exit-status" => Self::ExitStatus(SSHDecode::dec(s)?),
            b"exit-signal" => Self::ExitSignal(SSHDecode::dec(s)?),
            b"break" => Self::Break(SSHDecode::dec(s)?),
            b"x11-req" => Self::X11Req(SSHDecode::dec(s)?),
            b"keepalive@openssh.com" => Self::KeepAlive,
            _ => Self::Unknown(dec_unknown(s, var)),
        })
    }
}

wire_struct! {
#[derive(Debug)]
pub struct Exec<'a> {
    pub command: TextString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Subsystem<'a> {
    pub subsystem: TextString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Env<'a> {
    pub name: TextString<'a>,
    pub value: TextString<'a>,
}
}

wire_struct! {
/// The contents of a `"pty-req"` request.
///
/// Most function arguments use [`Pty`](crate::channel::Pty) rather than this struct.
#[derive(Debug)]
pub struct PtyReq<'a> {
    pub term: TextString<'a>,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    /// Encoded terminal modes, see [`termmodes`](crate::termmodes)
    pub modes: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug, Clone)]
pub struct WinChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}
}

wire_struct! {
/// A unix signal channel request
#[derive(Debug)]
pub struct Signal<'a> {
    /// Signal name without the "SIG" prefix
    pub sig: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ExitStatus {
    pub status: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ExitSignal<'a> {
    pub signal: &'a str,
    pub core: bool,
    pub error: TextString<'a>,
    pub lang: &'a str,
}
}

wire_struct! {
#[derive(Debug, Clone)]
pub struct Break {
    pub length: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct X11Req<'a> {
    pub single: bool,
    pub proto: &'a str,
    pub cookie: TextString<'a>,
    pub screen: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ForwardedTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct DirectTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct X11Open<'a> {
    pub origin: TextString<'a>,
    pub origin_port: u32,
}
}

// Placeholder for unknown method names. These are sometimes non-fatal and
// need to be handled by the relevant code, for example newly invented request types.
// This is deliberately not Serializable, we only receive it.
#[derive(Clone, PartialEq)]
pub struct Unknown<'a>(pub &'a [u8]);

impl core::fmt::Display for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = try_as_ascii_str(self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl core::fmt::Debug for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// State to be passed to decoding.
/// Use this so the parser can select the correct enum variant to decode.
#[derive(Default, Clone, Debug)]
pub struct ParseContext {
    /// The auth method a client last attempted, selects the type of
    /// message number 60.
    pub cli_auth_type: Option<AuthType>,

    // Set to true if an unknown variant is encountered.
    // Packet length checks should be omitted in that case.
    pub(crate) seen_unknown: bool,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident,
            $category:ident
            ),
             )*
    ) => {


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    // variants are eg
    // SSH_MSG_KEXINIT = 20,
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            // eg
            // 20 = Ok(MessageNumber::SSH_MSG_KEXINIT)
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => {
                Err(Error::UnknownPacket { number: v })
            }
        }
    }
}

impl SSHEncode for Packet<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let t = self.message_num() as u8;
        t.enc(s)?;
        match self {
            // eg
            // Packet::KexInit(p) => {
            // ...
            $(
            Packet::$SpecificPacketVariant(p) => {
                p.enc(s)?
            }
            )*
        };
        Ok(())
    }
}

impl<'a> SSHDecode<'a> for Packet<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'a> {
        let msg_num = u8::dec(s)?;
        let ty = MessageNumber::try_from(msg_num);
        let ty = match ty {
            Ok(t) => t,
            Err(_) => return Err(WireError::UnknownPacket { number: msg_num })
        };

        // Decode based on the message number
        let p = match ty {
            // eg
            // MessageNumber::SSH_MSG_KEXINIT => Packet::KexInit(
            // ...
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Top level SSH packet enum
#[derive(Debug)]
pub enum Packet<'a> {
    // eg KexInit(KexInit<'a>),
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl<'a> Packet<'a> {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            // eg
            // Packet::KexInit() => {
            // ..
            $(
            Packet::$SpecificPacketVariant(_) => {
                MessageNumber::$SSH_MESSAGE_NAME
            }
            )*
        }
    }

    pub fn category(&self) -> Category {
        match self {
            // eg
            // Packet::KexInit() => Category::Kex,
            $(
            Packet::$SpecificPacketVariant(_) => Category::$category,
            )*
        }
    }
}

$(
impl<'a> From<$SpecificPacketType> for Packet<'a> {
    fn from(s: $SpecificPacketType) -> Packet<'a> {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Allowed at any time.
    All,
    /// Key exchange messages, only between KEXINIT and NEWKEYS.
    Kex,
    /// Post-kex
    Auth,
    /// Post-auth
    Sess,
}

messagetypes![
(1, Disconnect, Disconnect<'a>, SSH_MSG_DISCONNECT, All),
(2, Ignore, Ignore<'a>, SSH_MSG_IGNORE, All),
(3, Unimplemented, Unimplemented, SSH_MSG_UNIMPLEMENTED, All),
(4, DebugPacket, DebugPacket<'a>, SSH_MSG_DEBUG, All),
(5, ServiceRequest, ServiceRequest<'a>, SSH_MSG_SERVICE_REQUEST, Auth),
(6, ServiceAccept, ServiceAccept<'a>, SSH_MSG_SERVICE_ACCEPT, Auth),
(20, KexInit, KexInit<'a>, SSH_MSG_KEXINIT, All),
(21, NewKeys, NewKeys, SSH_MSG_NEWKEYS, Kex),
(30, KexDHInit, KexDHInit<'a>, SSH_MSG_KEXDH_INIT, Kex),
(31, KexDHReply, KexDHReply<'a>, SSH_MSG_KEXDH_REPLY, Kex),

(50, UserauthRequest, UserauthRequest<'a>, SSH_MSG_USERAUTH_REQUEST, Auth),
(51, UserauthFailure, UserauthFailure<'a>, SSH_MSG_USERAUTH_FAILURE, Auth),
(52, UserauthSuccess, UserauthSuccess, SSH_MSG_USERAUTH_SUCCESS, Auth),
(53, UserauthBanner, UserauthBanner<'a>, SSH_MSG_USERAUTH_BANNER, Auth),
// One of
// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ
// SSH_MSG_USERAUTH_PK_OK
// SSH_MSG_USERAUTH_INFO_REQUEST
(60, Userauth60, Userauth60<'a>, SSH_MSG_USERAUTH_60, Auth),
(61, UserauthInfoResponse, UserauthInfoResponse<'a>, SSH_MSG_USERAUTH_INFO_RESPONSE, Auth),

(80, GlobalRequest, GlobalRequest<'a>, SSH_MSG_GLOBAL_REQUEST, Sess),
(81, RequestSuccess, RequestSuccess, SSH_MSG_REQUEST_SUCCESS, Sess),
(82, RequestFailure, RequestFailure, SSH_MSG_REQUEST_FAILURE, Sess),

(90, ChannelOpen, ChannelOpen<'a>, SSH_MSG_CHANNEL_OPEN, Sess),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION, Sess),
(92, ChannelOpenFailure, ChannelOpenFailure<'a>, SSH_MSG_CHANNEL_OPEN_FAILURE, Sess),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST, Sess),
(94, ChannelData, ChannelData<'a>, SSH_MSG_CHANNEL_DATA, Sess),
(95, ChannelDataExt, ChannelDataExt<'a>, SSH_MSG_CHANNEL_EXTENDED_DATA, Sess),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF, Sess),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE, Sess),
(98, ChannelRequest, ChannelRequest<'a>, SSH_MSG_CHANNEL_REQUEST, Sess),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS, Sess),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE, Sess),
];

#[cfg(test)]
pub(crate) mod tests {
    use crate::auth::AuthType;
    use crate::packets::*;
    use crate::sshlog::init_test_log;
    use crate::sshwire::tests::assert_serialize_equal;
    use crate::sshwire::{packet_from_bytes, write_ssh_vec};
    use pretty_hex::PrettyHex;

    pub fn test_roundtrip_context(p: &Packet, ctx: &ParseContext) {
        let buf = write_ssh_vec(p).unwrap();
        trace!("wrote packet {:?}", buf.hex_dump());

        let p2 = packet_from_bytes(&buf, ctx).unwrap();
        trace!("returned packet {:#?}", p2);
        assert_serialize_equal(p, &p2);
    }

    /// With default context
    pub fn test_roundtrip(p: &Packet) {
        test_roundtrip_context(p, &ParseContext::default());
    }

    #[test]
    /// check round trip of packet enums is right
    fn packet_type() {
        for i in 0..=255 {
            let ty = MessageNumber::try_from(i);
            if let Ok(ty) = ty {
                assert_eq!(i, ty as u8);
            }
        }
    }

    #[test]
    fn roundtrip_authpubkey() {
        init_test_log();
        let p = UserauthRequest {
            username: "matt".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: SSH_NAME_ED25519,
                pubkey: BinString(b"keyblob"),
                sig: None,
                force_sig: false,
            }),
        }
        .into();
        test_roundtrip(&p);

        let p = UserauthRequest {
            username: "matt".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: SSH_NAME_ED25519,
                pubkey: BinString(b"keyblob"),
                sig: Some(BinString(b"sigblob")),
                force_sig: false,
            }),
        }
        .into();
        test_roundtrip(&p);
    }

    #[test]
    fn force_sig_flag() {
        let m = |force_sig| MethodPubKey {
            sig_algo: SSH_NAME_RSA,
            pubkey: BinString(b"k"),
            sig: None,
            force_sig,
        };
        let a = write_ssh_vec(&m(false)).unwrap();
        let b = write_ssh_vec(&m(true)).unwrap();
        assert_eq!(a[0], 0);
        assert_eq!(b[0], 1);
        assert_eq!(a[1..], b[1..]);
    }

    #[test]
    fn roundtrip_password_change() {
        init_test_log();
        let p: Packet = UserauthRequest {
            username: "matt".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::Password(MethodPassword {
                password: "old".into(),
                new: Some("new".into()),
            }),
        }
        .into();
        test_roundtrip(&p);
        let b = write_ssh_vec(&p).unwrap();
        let p2 = packet_from_bytes(&b, &ParseContext::default()).unwrap();
        assert!(matches!(p2,
            Packet::UserauthRequest(UserauthRequest {
                method: AuthMethod::Password(MethodPassword { new: Some(TextString(b"new")), .. }),
                ..
            })
        ));
    }

    #[test]
    fn roundtrip_channel_open() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 111,
            initial_window: 50000,
            max_packet: 20000,
            ty: ChannelOpenType::DirectTcpip(DirectTcpip {
                address: "localhost".into(),
                port: 4444,
                origin: "somewhere".into(),
                origin_port: 0,
            }),
        });
        test_roundtrip(&p);

        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 899,
            max_packet: 14,
            ty: ChannelOpenType::Session,
        });
        test_roundtrip(&p);
    }

    #[test]
    fn channel_open_layout() {
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 5,
            initial_window: 6,
            max_packet: 7,
            ty: ChannelOpenType::Session,
        });
        let b = write_ssh_vec(&p).unwrap();
        assert_eq!(
            b,
            [90, 0, 0, 0, 7, b's', b'e', b's', b's', b'i', b'o', b'n',
                0, 0, 0, 5, 0, 0, 0, 6, 0, 0, 0, 7]
        );
    }

    #[test]
    fn unknown_method() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 899,
            max_packet: 14,
            ty: ChannelOpenType::Session,
        });
        let mut buf1 = write_ssh_vec(&p).unwrap();
        // change a byte of "session"
        buf1[8] = b'X';
        trace!("broken: {:?}", buf1.hex_dump());
        let ctx = ParseContext::default();
        let p2 = packet_from_bytes(&buf1, &ctx).unwrap();
        trace!("broken: {p2:#?}");
        assert!(matches!(p2,
            Packet::ChannelOpen(ChannelOpen { ty: ChannelOpenType::Unknown(_), ..})
        ));
    }

    #[test]
    fn unknown_request_trailing() {
        init_test_log();
        // an unknown request with payload that isn't parsed
        let mut b = vec![98, 0, 0, 0, 1];
        b.extend_from_slice(&[0, 0, 0, 4]);
        b.extend_from_slice(b"zzzz");
        b.push(1);
        b.extend_from_slice(&[1, 2, 3, 4, 5]);
        let p = packet_from_bytes(&b, &ParseContext::default()).unwrap();
        assert!(matches!(p,
            Packet::ChannelRequest(ChannelRequest {
                num: 1,
                want_reply: true,
                req: ChannelReqType::Unknown(Unknown(b"zzzz")),
            })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut b = write_ssh_vec(&Packet::ChannelEof(ChannelEof { num: 3 })).unwrap();
        b.push(0);
        assert!(matches!(
            packet_from_bytes(&b, &ParseContext::default()),
            Err(Error::WrongPacketLength)
        ));
    }

    #[test]
    #[should_panic]
    fn unknown_method_ser() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 200000,
            max_packet: 88200,
            ty: ChannelOpenType::Unknown(Unknown(b"audio-stream")),
        });
        write_ssh_vec(&p).unwrap();
    }

    /// Tests parsing a packet with a ParseContext.
    #[test]
    fn test_parse_context() {
        init_test_log();
        let mut ctx = ParseContext::new();

        let p = Userauth60::PwChangeReq(UserauthPwChangeReq {
            prompt: "change the password".into(),
            lang: "".into(),
        })
        .into();
        ctx.cli_auth_type = Some(AuthType::Password);
        test_roundtrip_context(&p, &ctx);

        let p = Userauth60::PkOk(UserauthPkOk {
            algo: SSH_NAME_ED25519,
            key: BinString(&[0x11, 0x22, 0x33]),
        })
        .into();
        ctx.cli_auth_type = Some(AuthType::PubKey);
        test_roundtrip_context(&p, &ctx);

        let p: Packet = Userauth60::InfoRequest(UserauthInfoRequest {
            name: "".into(),
            instruction: "answer these".into(),
            lang: "",
            prompts: vec![
                InfoPrompt { prompt: "one".into(), echo: true },
                InfoPrompt { prompt: "two".into(), echo: false },
            ],
        })
        .into();
        ctx.cli_auth_type = Some(AuthType::KbdInt);
        test_roundtrip_context(&p, &ctx);

        // no auth in progress
        let b = write_ssh_vec(&p).unwrap();
        assert!(packet_from_bytes(&b, &ParseContext::default()).is_err());
    }

    #[test]
    fn kbdint_prompt_limit() {
        let mut b = vec![61];
        b.extend_from_slice(&((KBDINT_MAX_PROMPTS as u32 + 1).to_be_bytes()));
        assert!(packet_from_bytes(&b, &ParseContext::default()).is_err());
    }

    #[test]
    fn request_success_port() {
        let b = [81u8, 0, 0, 0x1f, 0x90];
        let p = packet_from_bytes(&b, &ParseContext::default()).unwrap();
        assert!(matches!(p, Packet::RequestSuccess(RequestSuccess { bound_port: Some(8080) })));
        let b = [81u8];
        let p = packet_from_bytes(&b, &ParseContext::default()).unwrap();
        assert!(matches!(p, Packet::RequestSuccess(RequestSuccess { bound_port: None })));
    }
}
