//! Channel multiplexing, RFC4254.
//!
//! Channels live in an arena owned by the connection, keyed by the local
//! channel number. Everything else refers to them by [`ChanNum`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::task::Poll;
use std::collections::{BTreeMap, VecDeque};

use crate::behaviour::Behaviour;
use crate::buffer::SshBuffer;
use crate::config::{self, MAX_CHANNELS};
use crate::event::Event;
use crate::packets::{self, ChannelOpen, ChannelOpenType, ChannelReqType, Packet};
use crate::sshnames::*;
use crate::sshwire::{BinString, SSHEncodeEnum};
use crate::termmodes::TermModes;
use crate::traffic::TrafSend;

/// A local channel number
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct ChanNum(pub u32);

impl core::fmt::Display for ChanNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel data stream.
///
/// The SSH specification allows other extended data types, they are
/// discarded on receipt.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChanData {
    /// `SSH_MSG_CHANNEL_DATA`
    Normal,
    /// `SSH_MSG_CHANNEL_EXTENDED_DATA`
    Stderr,
}

impl ChanData {
    /// Only servers send stderr
    pub(crate) fn validate_send(&self, is_client: bool) -> Result<()> {
        if matches!(self, ChanData::Stderr) && is_client {
            Err(Error::BadUsage { msg: "client can't send stderr" })
        } else {
            Ok(())
        }
    }
}

/// The type of a channel, with its open parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChanKind {
    Session,
    DirectTcpip { address: String, port: u32, origin: String, origin_port: u32 },
    ForwardedTcpip { address: String, port: u32, origin: String, origin_port: u32 },
    X11 { origin: String, origin_port: u32 },
}

impl ChanKind {
    fn from_packet(ty: &ChannelOpenType) -> Option<Self> {
        Some(match ty {
            ChannelOpenType::Session => Self::Session,
            ChannelOpenType::DirectTcpip(t) => Self::DirectTcpip {
                address: t.address.to_string_lossy(),
                port: t.port,
                origin: t.origin.to_string_lossy(),
                origin_port: t.origin_port,
            },
            ChannelOpenType::ForwardedTcpip(t) => Self::ForwardedTcpip {
                address: t.address.to_string_lossy(),
                port: t.port,
                origin: t.origin.to_string_lossy(),
                origin_port: t.origin_port,
            },
            ChannelOpenType::X11(t) => {
                Self::X11 { origin: t.origin.to_string_lossy(), origin_port: t.origin_port }
            }
            ChannelOpenType::Unknown(_) => return None,
        })
    }

    fn packet(&self) -> ChannelOpenType<'_> {
        match self {
            Self::Session => ChannelOpenType::Session,
            Self::DirectTcpip { address, port, origin, origin_port } => {
                ChannelOpenType::DirectTcpip(packets::DirectTcpip {
                    address: address.as_str().into(),
                    port: *port,
                    origin: origin.as_str().into(),
                    origin_port: *origin_port,
                })
            }
            Self::ForwardedTcpip { address, port, origin, origin_port } => {
                ChannelOpenType::ForwardedTcpip(packets::ForwardedTcpip {
                    address: address.as_str().into(),
                    port: *port,
                    origin: origin.as_str().into(),
                    origin_port: *origin_port,
                })
            }
            Self::X11 { origin, origin_port } => ChannelOpenType::X11(packets::X11Open {
                origin: origin.as_str().into(),
                origin_port: *origin_port,
            }),
        }
    }
}

/// An application's reply to an incoming channel open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanOpened {
    Success,
    /// A SSH failure code
    Failure(ChanFail),
}

/// Parameters of a `pty-req`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: TermModes,
}

impl Default for Pty {
    fn default() -> Self {
        Pty {
            term: config::DEFAULT_TERM.into(),
            cols: 80,
            rows: 24,
            width: 0,
            height: 0,
            modes: TermModes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix
    pub signal: String,
    pub core_dumped: bool,
    pub message: String,
}

/// A channel request with owned contents.
///
/// Variants match [`packets::ChannelReqType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChanRequest {
    Pty(Pty),
    Shell,
    Exec { command: String },
    Subsystem { name: String },
    Env { name: String, value: String },
    WindowChange { cols: u32, rows: u32, width: u32, height: u32 },
    Signal { name: String },
    ExitStatus(u32),
    ExitSignal(ExitSignal),
    Break { length: u32 },
    X11 { single: bool, proto: String, cookie: String, screen: u32 },
    KeepAlive,
    /// A request type we don't know, received only
    Unknown(String),
}

impl ChanRequest {
    fn from_packet(r: &ChannelReqType) -> Result<Self> {
        Ok(match r {
            ChannelReqType::Pty(p) => {
                let term = p.term.as_ascii()?;
                if term.len() > config::MAX_TERM {
                    debug!("Long TERM {term:?}");
                    return Err(Error::BadString);
                }
                Self::Pty(Pty {
                    term: term.into(),
                    cols: p.cols,
                    rows: p.rows,
                    width: p.width,
                    height: p.height,
                    modes: TermModes::decode(p.modes.0)?,
                })
            }
            ChannelReqType::Shell => Self::Shell,
            ChannelReqType::Exec(e) => Self::Exec { command: e.command.to_string_lossy() },
            ChannelReqType::Subsystem(s) => {
                Self::Subsystem { name: s.subsystem.to_string_lossy() }
            }
            ChannelReqType::Env(e) => {
                Self::Env { name: e.name.to_string_lossy(), value: e.value.to_string_lossy() }
            }
            ChannelReqType::WinChange(w) => Self::WindowChange {
                cols: w.cols,
                rows: w.rows,
                width: w.width,
                height: w.height,
            },
            ChannelReqType::Signal(s) => Self::Signal { name: s.sig.into() },
            ChannelReqType::ExitStatus(e) => Self::ExitStatus(e.status),
            ChannelReqType::ExitSignal(e) => Self::ExitSignal(ExitSignal {
                signal: e.signal.into(),
                core_dumped: e.core,
                message: e.error.to_string_lossy(),
            }),
            ChannelReqType::Break(b) => Self::Break { length: b.length },
            ChannelReqType::X11Req(x) => Self::X11 {
                single: x.single,
                proto: x.proto.into(),
                cookie: x.cookie.to_string_lossy(),
                screen: x.screen,
            },
            ChannelReqType::KeepAlive => Self::KeepAlive,
            ChannelReqType::Unknown(u) => Self::Unknown(u.to_string()),
        })
    }

    /// The request type name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pty(_) => "pty-req",
            Self::Shell => "shell",
            Self::Exec { .. } => "exec",
            Self::Subsystem { .. } => "subsystem",
            Self::Env { .. } => "env",
            Self::WindowChange { .. } => "window-change",
            Self::Signal { .. } => "signal",
            Self::ExitStatus(_) => "exit-status",
            Self::ExitSignal(_) => "exit-signal",
            Self::Break { .. } => "break",
            Self::X11 { .. } => "x11-req",
            Self::KeepAlive => SSH_REQ_KEEPALIVE,
            Self::Unknown(_) => "unknown",
        }
    }

    fn send(&self, num: u32, want_reply: bool, s: &mut TrafSend) -> Result<()> {
        // pty modes need storage for the packet's lifetime
        let modes;
        let req = match self {
            Self::Pty(p) => {
                modes = p.modes.encode();
                ChannelReqType::Pty(packets::PtyReq {
                    term: p.term.as_str().into(),
                    cols: p.cols,
                    rows: p.rows,
                    width: p.width,
                    height: p.height,
                    modes: BinString(&modes),
                })
            }
            Self::Shell => ChannelReqType::Shell,
            Self::Exec { command } => {
                ChannelReqType::Exec(packets::Exec { command: command.as_str().into() })
            }
            Self::Subsystem { name } => {
                ChannelReqType::Subsystem(packets::Subsystem { subsystem: name.as_str().into() })
            }
            Self::Env { name, value } => ChannelReqType::Env(packets::Env {
                name: name.as_str().into(),
                value: value.as_str().into(),
            }),
            Self::WindowChange { cols, rows, width, height } => {
                ChannelReqType::WinChange(packets::WinChange {
                    cols: *cols,
                    rows: *rows,
                    width: *width,
                    height: *height,
                })
            }
            Self::Signal { name } => ChannelReqType::Signal(packets::Signal { sig: name }),
            Self::ExitStatus(status) => {
                ChannelReqType::ExitStatus(packets::ExitStatus { status: *status })
            }
            Self::ExitSignal(e) => ChannelReqType::ExitSignal(packets::ExitSignal {
                signal: &e.signal,
                core: e.core_dumped,
                error: e.message.as_str().into(),
                lang: "",
            }),
            Self::Break { length } => ChannelReqType::Break(packets::Break { length: *length }),
            Self::X11 { single, proto, cookie, screen } => {
                ChannelReqType::X11Req(packets::X11Req {
                    single: *single,
                    proto,
                    cookie: cookie.as_str().into(),
                    screen: *screen,
                })
            }
            Self::KeepAlive => ChannelReqType::KeepAlive,
            Self::Unknown(_) => {
                return Err(Error::BadUsage { msg: "can't send an unknown request" })
            }
        };
        s.send(packets::ChannelRequest { num, want_reply, req })
    }
}

/// Identifies a sent channel request awaiting a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqId(u64);

/// Readiness of a channel, from [`Session::channel_select()`](crate::Session::channel_select)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanReady {
    pub num: ChanNum,
    /// Data or EOF can be read
    pub readable: bool,
    /// The peer's window has room
    pub writable: bool,
    /// Closed by the peer, or the open failed
    pub exceptional: bool,
}

impl ChanReady {
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.exceptional
    }
}

/// Per-direction channel variables
#[derive(Debug)]
struct ChanDir {
    /// Sender-side number, included in most sent packets
    num: u32,
    max_packet: u32,
    window: u32,
}

#[derive(Debug)]
enum ChanState {
    /// We sent an open, awaiting the peer's confirmation
    Opening,
    Open,
    /// The peer refused our open, or misbehaved while it was pending
    Failed { reason: u32, desc: String },
}

#[derive(Debug)]
pub(crate) struct Channel {
    num: ChanNum,
    kind: ChanKind,
    state: ChanState,

    /// Populated once open
    send: Option<ChanDir>,

    /// Credit we have given the peer
    recv_window: u32,
    full_window: u32,
    max_packet: u32,

    stdout: SshBuffer,
    stderr: SshBuffer,

    sent_eof: bool,
    sent_close: bool,
    recv_eof: bool,
    recv_close: bool,
    /// `Event::Close` has been queued
    close_reported: bool,

    next_req: u64,
    /// Sent requests with `want_reply`, replies arrive in order
    outstanding: VecDeque<(ReqId, &'static str)>,
    replies: VecDeque<(ReqId, &'static str, bool)>,

    exit_status: Option<u32>,
    exit_signal: Option<ExitSignal>,
}

impl Channel {
    fn new(num: ChanNum, kind: ChanKind, window: u32, max_packet: u32) -> Self {
        Channel {
            num,
            kind,
            state: ChanState::Opening,
            send: None,
            recv_window: window,
            full_window: window,
            max_packet,
            stdout: SshBuffer::new(),
            stderr: SshBuffer::new(),
            sent_eof: false,
            sent_close: false,
            recv_eof: false,
            recv_close: false,
            close_reported: false,
            next_req: 0,
            outstanding: VecDeque::new(),
            replies: VecDeque::new(),
            exit_status: None,
            exit_signal: None,
        }
    }

    /// Remote channel number, fails while opening
    fn send_num(&self) -> Result<u32> {
        Ok(self.send.as_ref().trap()?.num)
    }

    fn buf(&mut self, dt: ChanData) -> &mut SshBuffer {
        match dt {
            ChanData::Normal => &mut self.stdout,
            ChanData::Stderr => &mut self.stderr,
        }
    }

    fn buffered(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    fn is_open(&self) -> bool {
        matches!(self.state, ChanState::Open)
    }

    /// Closed by the peer with all received data read
    fn is_closed(&self) -> bool {
        self.recv_close && self.buffered() == 0
    }

    fn open_confirmation(&self) -> Result<Packet<'static>> {
        Ok(packets::ChannelOpenConfirmation {
            num: self.send_num()?,
            sender_num: self.num.0,
            initial_window: self.recv_window,
            max_packet: self.max_packet,
        }
        .into())
    }

    fn check_writable(&self) -> Result<()> {
        match self.state {
            ChanState::Open => (),
            ChanState::Opening => return Err(Error::BadUsage { msg: "channel is opening" }),
            ChanState::Failed { .. } => return Err(Error::BadChannel { num: self.num }),
        }
        if self.sent_eof || self.sent_close || self.recv_close {
            return Err(Error::ChannelEOF);
        }
        Ok(())
    }

    fn send_eof(&mut self, s: &mut TrafSend) -> Result<()> {
        if !self.sent_eof && !self.sent_close && self.is_open() {
            s.send(packets::ChannelEof { num: self.send_num()? })?;
            self.sent_eof = true;
        }
        Ok(())
    }

    /// Sends EOF then CLOSE, as needed
    fn send_close(&mut self, s: &mut TrafSend) -> Result<()> {
        self.send_eof(s)?;
        if !self.sent_close && self.is_open() {
            s.send(packets::ChannelClose { num: self.send_num()? })?;
            self.sent_close = true;
        }
        Ok(())
    }

    /// Accounts for received data, returns `false` if it should be discarded
    fn receive(&mut self, len: usize) -> bool {
        if self.recv_eof || self.recv_close {
            debug!("Channel {} data after EOF", self.num);
            return false;
        }
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > self.recv_window {
            warn!(
                "Channel {} peer sent {len} bytes exceeding window {}",
                self.num, self.recv_window
            );
            self.recv_window = 0;
        } else {
            self.recv_window -= len;
        }
        true
    }

    /// Returns a window adjustment to send if the window has dropped below
    /// half. Unread data counts against the window.
    fn check_window_adjust(&mut self) -> Option<Packet<'static>> {
        if self.recv_eof || self.recv_close || self.sent_close {
            return None;
        }
        let num = self.send.as_ref()?.num;
        if self.recv_window >= self.full_window / 2 {
            return None;
        }
        let buffered = u32::try_from(self.buffered()).unwrap_or(u32::MAX);
        let adjust = self.full_window.saturating_sub(self.recv_window.saturating_add(buffered));
        if adjust == 0 {
            return None;
        }
        self.recv_window += adjust;
        trace!("Channel {} window adjust {adjust}", self.num);
        Some(packets::ChannelWindowAdjust { num, adjust }.into())
    }

    /// Queues `Event::Close` once the peer closed and buffers are drained
    fn check_close_event(&mut self, events: &mut VecDeque<Event>) {
        if !self.close_reported && self.is_closed() {
            self.close_reported = true;
            events.push_back(Event::Close { num: self.num });
        }
    }

    fn dispatch_request(
        &mut self,
        p: &packets::ChannelRequest,
        s: &mut TrafSend,
        b: &mut Behaviour<'_>,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        let success = match ChanRequest::from_packet(&p.req) {
            Ok(req) => {
                let ok = match &req {
                    ChanRequest::ExitStatus(status) if b.is_client() => {
                        debug!("Channel {} exit status {status}", self.num);
                        self.exit_status = Some(*status);
                        true
                    }
                    ChanRequest::ExitSignal(sig) if b.is_client() => {
                        debug!("Channel {} exit signal {}", self.num, sig.signal);
                        self.exit_signal = Some(sig.clone());
                        true
                    }
                    ChanRequest::KeepAlive => false,
                    ChanRequest::Unknown(name) => {
                        debug!("Unknown channel request '{name}'");
                        false
                    }
                    req => b.channel_request(self.num, req),
                };
                if ok {
                    events.push_back(Event::ChannelRequest { num: self.num, req });
                }
                ok
            }
            Err(e) => {
                debug!("Bad channel request {:?}: {e}", p.req.variant_name().ok());
                false
            }
        };

        if p.want_reply && !self.sent_close {
            let num = self.send_num()?;
            if success {
                s.send(packets::ChannelSuccess { num })?;
            } else {
                s.send(packets::ChannelFailure { num })?;
            }
        }
        Ok(())
    }

    fn handle_reply(&mut self, success: bool) -> Result<()> {
        let Some((id, what)) = self.outstanding.pop_front() else {
            debug!("Channel {} reply without a request", self.num);
            return Err(Error::SSHProtoError);
        };
        trace!("Channel {} request {what} success {success}", self.num);
        self.replies.push_back((id, what, success));
        Ok(())
    }
}

pub(crate) struct Channels {
    ch: BTreeMap<u32, Channel>,
    next_num: u32,
    window: u32,
    max_packet: u32,
    is_client: bool,
}

impl Channels {
    pub fn new(is_client: bool, window: u32, max_packet: u32) -> Self {
        Channels { ch: BTreeMap::new(), next_num: 0, window, max_packet, is_client }
    }

    /// Returns a `Channel` in any state
    fn get_any(&self, num: ChanNum) -> Result<&Channel> {
        self.ch.get(&num.0).ok_or(Error::BadChannel { num })
    }

    fn get_any_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        self.ch.get_mut(&num.0).ok_or(Error::BadChannel { num })
    }

    /// Returns a `Channel` that isn't waiting on the peer to open.
    fn get_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        let ch = self.get_any_mut(num)?;
        match ch.state {
            ChanState::Opening => Err(Error::BadChannel { num }),
            _ => Ok(ch),
        }
    }

    pub fn nums(&self) -> impl Iterator<Item = ChanNum> + '_ {
        self.ch.keys().map(|n| ChanNum(*n))
    }

    pub fn len(&self) -> usize {
        self.ch.len()
    }

    /// Returns the next unused channel number
    fn unused_chan(&mut self) -> Option<ChanNum> {
        if self.ch.len() >= MAX_CHANNELS {
            return None;
        }
        // numbers increase monotonically, skipping any still in use after a wrap
        loop {
            let n = self.next_num;
            self.next_num = self.next_num.wrapping_add(1);
            if !self.ch.contains_key(&n) {
                return Some(ChanNum(n));
            }
        }
    }

    /// Sends a channel open, the channel is `Opening` until the peer replies.
    pub fn open(&mut self, kind: ChanKind, s: &mut TrafSend) -> Result<ChanNum> {
        let num = self.unused_chan().ok_or(Error::NotAvailable { what: "channel" })?;
        let ch = Channel::new(num, kind, self.window, self.max_packet);
        s.send(ChannelOpen {
            num: num.0,
            initial_window: ch.recv_window,
            max_packet: ch.max_packet,
            ty: ch.kind.packet(),
        })?;
        debug!("Opening channel {num} {:?}", ch.kind);
        self.ch.insert(num.0, ch);
        Ok(num)
    }

    /// Checks whether an open has completed. A failed channel is removed.
    pub fn poll_open(&mut self, num: ChanNum) -> Result<Poll<()>> {
        let ch = self.get_any(num)?;
        match &ch.state {
            ChanState::Opening => Ok(Poll::Pending),
            ChanState::Open => Ok(Poll::Ready(())),
            ChanState::Failed { reason, desc } => {
                let e = Error::ChannelOpenFailed { reason: *reason, desc: desc.clone() };
                self.ch.remove(&num.0);
                Err(e)
            }
        }
    }

    /// Sends as much of `data` as the peer's window allows, returning
    /// the length sent. Zero means the window is exhausted.
    pub fn write(
        &mut self,
        num: ChanNum,
        dt: ChanData,
        data: &[u8],
        s: &mut TrafSend,
    ) -> Result<usize> {
        dt.validate_send(self.is_client)?;
        let ch = self.get_mut(num)?;
        ch.check_writable()?;
        let send = ch.send.as_mut().trap()?;

        let mut sent = 0;
        while sent < data.len() {
            let n = (data.len() - sent).min(send.window as usize).min(send.max_packet as usize);
            if n == 0 {
                break;
            }
            let d = BinString(&data[sent..sent + n]);
            let p: Packet = match dt {
                ChanData::Normal => packets::ChannelData { num: send.num, data: d }.into(),
                ChanData::Stderr => packets::ChannelDataExt {
                    num: send.num,
                    code: SSH_EXTENDED_DATA_STDERR,
                    data: d,
                }
                .into(),
            };
            s.send(p)?;
            // n is bounded by the window
            send.window -= n as u32;
            sent += n;
        }
        Ok(sent)
    }

    /// The peer's current window
    pub fn send_window(&self, num: ChanNum) -> Result<u32> {
        Ok(self.get_any(num)?.send.as_ref().map_or(0, |s| s.window))
    }

    /// Reads buffered data, returning 0 if none is available.
    pub fn read(
        &mut self,
        num: ChanNum,
        dt: ChanData,
        buf: &mut [u8],
        s: &mut TrafSend,
        events: &mut VecDeque<Event>,
    ) -> Result<usize> {
        let ch = self.get_mut(num)?;
        let n = ch.buf(dt).read(buf);
        if n > 0 {
            if let Some(p) = ch.check_window_adjust() {
                s.send(p)?;
            }
            ch.check_close_event(events);
        }
        Ok(n)
    }

    /// Bytes available to read, or `None` at EOF with nothing buffered.
    pub fn poll(&self, num: ChanNum, dt: ChanData) -> Result<Option<usize>> {
        let ch = self.get_any(num)?;
        let n = match dt {
            ChanData::Normal => ch.stdout.len(),
            ChanData::Stderr => ch.stderr.len(),
        };
        if n == 0 && (ch.recv_eof || ch.recv_close) {
            Ok(None)
        } else {
            Ok(Some(n))
        }
    }

    pub fn is_eof(&self, num: ChanNum) -> Result<bool> {
        let ch = self.get_any(num)?;
        Ok((ch.recv_eof || ch.recv_close) && ch.buffered() == 0)
    }

    /// The peer has closed the channel and all data has been read
    pub fn is_closed(&self, num: ChanNum) -> Result<bool> {
        Ok(self.get_any(num)?.is_closed())
    }

    pub fn ready(&self, num: ChanNum) -> Result<ChanReady> {
        let ch = self.get_any(num)?;
        let failed = matches!(ch.state, ChanState::Failed { .. });
        Ok(ChanReady {
            num,
            readable: ch.buffered() > 0 || ch.recv_eof || ch.recv_close,
            writable: ch.check_writable().is_ok() && ch.send.as_ref().is_some_and(|s| s.window > 0),
            exceptional: failed || ch.recv_close,
        })
    }

    pub fn exit_status(&self, num: ChanNum) -> Result<Option<u32>> {
        Ok(self.get_any(num)?.exit_status)
    }

    pub fn exit_signal(&self, num: ChanNum) -> Result<Option<ExitSignal>> {
        Ok(self.get_any(num)?.exit_signal.clone())
    }

    pub fn send_eof(&mut self, num: ChanNum, s: &mut TrafSend) -> Result<()> {
        self.get_mut(num)?.send_eof(s)
    }

    pub fn close(&mut self, num: ChanNum, s: &mut TrafSend) -> Result<()> {
        self.get_mut(num)?.send_close(s)
    }

    /// Closes the channel if needed and releases its number.
    pub fn free(&mut self, num: ChanNum, s: &mut TrafSend) -> Result<()> {
        let ch = self.get_any_mut(num)?;
        ch.send_close(s)?;
        trace!("Freeing channel {num}");
        self.ch.remove(&num.0);
        Ok(())
    }

    /// Sends EOF and CLOSE on every channel, for session teardown
    pub fn close_all(&mut self, s: &mut TrafSend) -> Result<()> {
        for ch in self.ch.values_mut() {
            ch.send_close(s)?;
        }
        Ok(())
    }

    /// Sends a request, returning an id to poll if a reply is wanted.
    pub fn request(
        &mut self,
        num: ChanNum,
        req: &ChanRequest,
        want_reply: bool,
        s: &mut TrafSend,
    ) -> Result<Option<ReqId>> {
        let ch = self.get_mut(num)?;
        if !ch.is_open() || ch.sent_close {
            return Err(Error::ChannelEOF);
        }
        req.send(ch.send_num()?, want_reply, s)?;
        trace!("Channel {num} sent request {}", req.name());
        if !want_reply {
            return Ok(None);
        }
        let id = ReqId(ch.next_req);
        ch.next_req += 1;
        ch.outstanding.push_back((id, req.name()));
        Ok(Some(id))
    }

    /// Checks for a request reply. A FAILURE reply is `RequestDenied`.
    pub fn poll_request(&mut self, num: ChanNum, id: ReqId) -> Result<Poll<()>> {
        let ch = self.get_any_mut(num)?;
        let Some(pos) = ch.replies.iter().position(|(i, _, _)| *i == id) else {
            if ch.outstanding.iter().any(|(i, _)| *i == id) {
                if ch.recv_close {
                    return Err(Error::ChannelEOF);
                }
                return Ok(Poll::Pending);
            }
            return Err(Error::BadUsage { msg: "unknown request" });
        };
        let (_, what, success) = ch.replies.remove(pos).trap()?;
        if success {
            Ok(Poll::Ready(()))
        } else {
            Err(Error::RequestDenied { what })
        }
    }

    fn dispatch_open(
        &mut self,
        p: &ChannelOpen<'_>,
        s: &mut TrafSend,
        b: &mut Behaviour<'_>,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        match self.dispatch_open_inner(p, s, b, events) {
            Err(f) => {
                debug!("Refusing channel open: {f:?}");
                s.send(packets::ChannelOpenFailure {
                    // ChannelOpen.num is the sender's number
                    num: p.num,
                    reason: f as u32,
                    desc: "".into(),
                    lang: "",
                })
            }
            Ok(r) => r,
        }
    }

    // the caller sends a failure message for an Err
    fn dispatch_open_inner(
        &mut self,
        p: &ChannelOpen<'_>,
        s: &mut TrafSend,
        b: &mut Behaviour<'_>,
        events: &mut VecDeque<Event>,
    ) -> Result<Result<()>, ChanFail> {
        let Some(kind) = ChanKind::from_packet(&p.ty) else {
            debug!("Unknown channel type '{:?}'", p.ty);
            return Err(ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE);
        };
        if b.is_client() && kind == ChanKind::Session {
            return Err(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED);
        }
        let num = self.unused_chan().ok_or(ChanFail::SSH_OPEN_RESOURCE_SHORTAGE)?;

        if let ChanOpened::Failure(f) = b.open_channel(num, &kind) {
            return Err(f);
        }

        let mut ch = Channel::new(num, kind.clone(), self.window, self.max_packet);
        ch.send = Some(ChanDir {
            num: p.num,
            max_packet: p.max_packet,
            window: p.initial_window,
        });
        ch.state = ChanState::Open;
        let r = ch.open_confirmation().and_then(|c| s.send(c));
        debug!("Accepted channel {num} {kind:?}");
        self.ch.insert(num.0, ch);
        events.push_back(Event::ChannelOpened { num, kind });
        Ok(r)
    }

    /// Incoming channel packets
    pub fn dispatch(
        &mut self,
        packet: Packet<'_>,
        s: &mut TrafSend,
        b: &mut Behaviour<'_>,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        let r = self.dispatch_inner(packet, s, b, events);
        match r {
            Err(Error::BadChannel { num }) => {
                warn!("Ignoring bad channel number {num}");
                Ok(())
            }
            r => r,
        }
    }

    fn dispatch_inner(
        &mut self,
        packet: Packet<'_>,
        s: &mut TrafSend,
        b: &mut Behaviour<'_>,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        if let Packet::ChannelOpen(p) = &packet {
            return self.dispatch_open(p, s, b, events);
        }

        let num = match &packet {
            Packet::ChannelOpenConfirmation(p) => p.num,
            Packet::ChannelOpenFailure(p) => p.num,
            Packet::ChannelWindowAdjust(p) => p.num,
            Packet::ChannelData(p) => p.num,
            Packet::ChannelDataExt(p) => p.num,
            Packet::ChannelEof(p) => p.num,
            Packet::ChannelClose(p) => p.num,
            Packet::ChannelRequest(p) => p.num,
            Packet::ChannelSuccess(p) => p.num,
            Packet::ChannelFailure(p) => p.num,
            _ => return Error::bug_msg("not a channel packet"),
        };
        let ch = self.get_any_mut(ChanNum(num))?;

        if let ChanState::Opening = ch.state {
            match packet {
                Packet::ChannelOpenConfirmation(p) => {
                    ch.send = Some(ChanDir {
                        num: p.sender_num,
                        max_packet: p.max_packet,
                        window: p.initial_window,
                    });
                    ch.state = ChanState::Open;
                    debug!("Channel {} open, peer window {}", ch.num, p.initial_window);
                }
                Packet::ChannelOpenFailure(p) => {
                    let desc = p.desc.to_string_lossy();
                    debug!("Channel {} open failed ({}) {desc}", ch.num, p.reason);
                    ch.state = ChanState::Failed { reason: p.reason, desc };
                }
                p => {
                    // only fails this open attempt
                    debug!("Unexpected {:?} for opening channel {}", p.message_num(), ch.num);
                    ch.state = ChanState::Failed {
                        reason: 0,
                        desc: "unexpected message while opening".into(),
                    };
                }
            }
            return Ok(());
        }

        if let ChanState::Failed { .. } = ch.state {
            match packet {
                Packet::ChannelOpenConfirmation(p) => {
                    // The peer considers it open, close their end
                    debug!("Late confirmation for failed channel {}, closing", ch.num);
                    s.send(packets::ChannelClose { num: p.sender_num })?;
                }
                p => trace!("Ignoring {:?} for failed channel {}", p.message_num(), ch.num),
            }
            return Ok(());
        }

        match packet {
            Packet::ChannelOpenConfirmation(_) | Packet::ChannelOpenFailure(_) => {
                trace!("Open reply for channel {} that isn't opening", ch.num);
                return Err(Error::SSHProtoError);
            }
            Packet::ChannelWindowAdjust(p) => {
                let send = ch.send.as_mut().trap()?;
                send.window = send.window.saturating_add(p.adjust);
            }
            Packet::ChannelData(p) => {
                if ch.receive(p.data.0.len()) {
                    ch.stdout.extend(p.data.0);
                }
                if let Some(p) = ch.check_window_adjust() {
                    s.send(p)?;
                }
            }
            Packet::ChannelDataExt(p) => {
                if ch.receive(p.data.0.len()) {
                    if p.code == SSH_EXTENDED_DATA_STDERR {
                        ch.stderr.extend(p.data.0);
                    } else {
                        debug!("Discarding extended data type {}", p.code);
                    }
                }
                if let Some(p) = ch.check_window_adjust() {
                    s.send(p)?;
                }
            }
            Packet::ChannelEof(_) => {
                trace!("Channel {} received EOF", ch.num);
                ch.recv_eof = true;
                events.push_back(Event::Eof { num: ch.num });
            }
            Packet::ChannelClose(_) => {
                debug!("Channel {} closed by peer, {} bytes unread", ch.num, ch.buffered());
                ch.recv_close = true;
                if !ch.sent_close {
                    s.send(packets::ChannelClose { num: ch.send_num()? })?;
                    ch.sent_close = true;
                }
                ch.check_close_event(events);
            }
            Packet::ChannelRequest(p) => ch.dispatch_request(&p, s, b, events)?,
            Packet::ChannelSuccess(_) => ch.handle_reply(true)?,
            Packet::ChannelFailure(_) => ch.handle_reply(false)?,
            _ => return Error::bug_msg("not a channel packet"),
        }
        Ok(())
    }
}

/// A global request with owned contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReq {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
    KeepAlive,
    Unknown(String),
}

impl GlobalReq {
    fn from_packet(r: &packets::GlobalRequestMethod) -> Self {
        use packets::GlobalRequestMethod as M;
        match r {
            M::TcpipForward(t) => {
                Self::TcpipForward { address: t.address.to_string_lossy(), port: t.port }
            }
            M::CancelTcpipForward(t) => {
                Self::CancelTcpipForward { address: t.address.to_string_lossy(), port: t.port }
            }
            M::KeepAlive => Self::KeepAlive,
            M::Unknown(u) => Self::Unknown(u.to_string()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TcpipForward { .. } => "tcpip-forward",
            Self::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            Self::KeepAlive => SSH_REQ_KEEPALIVE,
            Self::Unknown(_) => "unknown",
        }
    }
}

/// An application's reply to a global request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalReply {
    /// A `tcpip-forward` for port 0 returns the bound port
    Success { bound_port: Option<u32> },
    Failure,
}

/// Outstanding global requests we sent. Replies arrive in order.
#[derive(Default)]
pub(crate) struct GlobalRequests {
    next: u64,
    outstanding: VecDeque<(ReqId, &'static str)>,
    replies: VecDeque<(ReqId, &'static str, Option<Option<u32>>)>,
}

impl GlobalRequests {
    pub fn send(&mut self, req: &GlobalReq, want_reply: bool, s: &mut TrafSend) -> Result<Option<ReqId>> {
        use packets::GlobalRequestMethod as M;
        let m = match req {
            GlobalReq::TcpipForward { address, port } => M::TcpipForward(packets::TcpipForward {
                address: address.as_str().into(),
                port: *port,
            }),
            GlobalReq::CancelTcpipForward { address, port } => {
                M::CancelTcpipForward(packets::TcpipForward {
                    address: address.as_str().into(),
                    port: *port,
                })
            }
            GlobalReq::KeepAlive => M::KeepAlive,
            GlobalReq::Unknown(_) => {
                return Err(Error::BadUsage { msg: "can't send an unknown request" })
            }
        };
        s.send(packets::GlobalRequest { want_reply, req: m })?;
        if !want_reply {
            return Ok(None);
        }
        let id = ReqId(self.next);
        self.next += 1;
        self.outstanding.push_back((id, req.name()));
        Ok(Some(id))
    }

    /// `Ready(bound_port)` on success
    pub fn poll(&mut self, id: ReqId) -> Result<Poll<Option<u32>>> {
        let Some(pos) = self.replies.iter().position(|(i, _, _)| *i == id) else {
            if self.outstanding.iter().any(|(i, _)| *i == id) {
                return Ok(Poll::Pending);
            }
            return Err(Error::BadUsage { msg: "unknown request" });
        };
        match self.replies.remove(pos).trap()? {
            (_, _, Some(port)) => Ok(Poll::Ready(port)),
            (_, what, None) => Err(Error::RequestDenied { what }),
        }
    }

    /// Incoming request from the peer
    pub fn dispatch_request(
        &mut self,
        p: &packets::GlobalRequest,
        s: &mut TrafSend,
        b: &mut Behaviour<'_>,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        let req = GlobalReq::from_packet(&p.req);
        let reply = match req {
            GlobalReq::Unknown(ref name) => {
                debug!("Unknown global request '{name}'");
                GlobalReply::Failure
            }
            ref req => b.global_request(req),
        };
        trace!("Global request {} reply {reply:?}", req.name());
        if p.want_reply {
            match reply {
                GlobalReply::Success { bound_port } => {
                    s.send(packets::RequestSuccess { bound_port })?
                }
                GlobalReply::Failure => s.send(packets::RequestFailure {})?,
            }
        }
        if let GlobalReply::Success { .. } = reply {
            events.push_back(Event::GlobalRequest(req));
        }
        Ok(())
    }

    pub fn handle_reply(&mut self, bound_port: Option<Option<u32>>) -> Result<()> {
        let Some((id, what)) = self.outstanding.pop_front() else {
            debug!("Global request reply without a request");
            return Err(Error::SSHProtoError);
        };
        self.replies.push_back((id, what, bound_port));
        Ok(())
    }
}
