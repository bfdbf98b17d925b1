//! The application facing [`Session`].
//!
//! A session drives one SSH connection over a [`Transport`]. Operations that
//! may wait for the peer come in two forms. `try_*` and `poll_*` methods
//! perform whatever IO is possible without blocking and return
//! [`Poll::Pending`] when called too early, keeping their progress for the
//! next call. The plain methods loop on those, waiting on the transport
//! between attempts.
//!
//! Every wait pumps the single receive path, so packets for other channels
//! are handled and buffered while an operation waits.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::task::Poll;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

use crate::auth::{AuthMethods, AuthResult, KbdIntChallenge};
use crate::buffer::SshBuffer;
use crate::channel::{
    ChanData, ChanKind, ChanNum, ChanReady, ChanRequest, ExitSignal, GlobalReq, Pty, ReqId,
};
use crate::cliauth::CliAuth;
use crate::client::ClientHandler;
use crate::config::SshConfig;
use crate::conn::{CliServ, Conn, SessionState};
use crate::encrypt::KeyState;
use crate::event::Event;
use crate::ident::RemoteVersion;
use crate::kex::Negotiated;
use crate::servauth::ServAuth;
use crate::server::ServerHandler;
use crate::sign::SignKey;
use crate::sshnames::DisconnectReason;
use crate::traffic::{TrafIn, TrafOut, TrafSend};
use crate::transport::Transport;

/// Bytes read from the transport at a time
const READ_SIZE: usize = 16 * 1024;

/// A SSH client or server connection
pub struct Session {
    transport: Box<dyn Transport>,
    conn: Conn,
    keys: KeyState,
    tin: TrafIn,
    tout: TrafOut,
    remote_version: RemoteVersion,
    /// Input read from the transport, not yet framed
    rx: SshBuffer,
    /// The transport reached end of stream
    eof: bool,
    closed: bool,
}

impl Session {
    /// Starts a client session. The identification line and KEXINIT are
    /// queued immediately, the handshake proceeds as the session is polled.
    ///
    /// [`initialize()`](crate::initialize) must have been called.
    pub fn client(
        transport: impl Transport + 'static,
        config: SshConfig,
        handler: impl ClientHandler + 'static,
    ) -> Result<Self> {
        let cs = CliServ::Client { auth: CliAuth::new(), handler: Box::new(handler) };
        Self::new(Box::new(transport), config, cs)
    }

    /// Starts a server session with the given host keys.
    pub fn server(
        transport: impl Transport + 'static,
        config: SshConfig,
        hostkeys: Vec<Box<dyn SignKey>>,
        handler: impl ServerHandler + 'static,
    ) -> Result<Self> {
        if hostkeys.is_empty() {
            return Err(Error::BadUsage { msg: "no host keys" });
        }
        let cs = CliServ::Server {
            auth: ServAuth::new(),
            hostkeys,
            handler: Box::new(handler),
            service_accepted: false,
        };
        Self::new(Box::new(transport), config, cs)
    }

    fn new(mut transport: Box<dyn Transport>, mut config: SshConfig, cs: CliServ) -> Result<Self> {
        crate::init::check()?;
        config.validate()?;
        transport.set_nonblocking(true)?;
        let is_client = matches!(cs, CliServ::Client { .. });
        let keys = KeyState::new_cleartext(config.provider.clone());
        let conn = Conn::new(config, cs)?;

        let mut sess = Session {
            transport,
            conn,
            keys,
            tin: TrafIn::new(),
            tout: TrafOut::new(),
            remote_version: RemoteVersion::new(is_client),
            rx: SshBuffer::with_capacity(READ_SIZE),
            eof: false,
            closed: false,
        };
        sess.tout.send_version(sess.conn.our_version())?;
        sess.with_send(|c, s| c.start(s))?;
        debug!("Session created, {}", sess.conn.our_version());
        Ok(sess)
    }

    pub fn is_client(&self) -> bool {
        self.conn.is_client()
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.remote_version.version().is_none() {
            SessionState::Banner
        } else {
            self.conn.state()
        }
    }

    /// The peer's identification line, once received
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.version()
    }

    /// The exchange hash of the first key exchange
    pub fn session_id(&self) -> Option<&[u8]> {
        self.conn.sess_id().map(|s| s.as_slice())
    }

    /// Algorithms from the most recent key exchange
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.conn.negotiated()
    }

    /// The server's accepted host key blob, clients only
    pub fn peer_hostkey(&self) -> Option<&[u8]> {
        self.conn.peer_hostkey()
    }

    /// The configuration in use, after unsupported algorithms were removed
    pub fn config(&self) -> &SshConfig {
        &self.conn.config
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Runs `f` with an output sink, failing the session on a fatal error.
    fn with_send<T>(&mut self, f: impl FnOnce(&mut Conn, &mut TrafSend) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let mut s = TrafSend::new(&mut self.tout, &mut self.keys);
        match f(&mut self.conn, &mut s) {
            Ok(t) => Ok(t),
            Err(e) if e.is_fatal() => Err(self.fail(e)),
            Err(e) => Err(e),
        }
    }

    /// Ends the session after a fatal error, returning the error.
    fn fail(&mut self, e: Error) -> Error {
        if self.closed {
            return e;
        }
        info!("Session failed: {e}");
        let reason = match e {
            Error::BadDecrypt => Some(DisconnectReason::SSH_DISCONNECT_MAC_ERROR),
            Error::Compression => Some(DisconnectReason::SSH_DISCONNECT_COMPRESSION_ERROR),
            Error::BadKex | Error::BadSig | Error::AlgoNoMatch { .. } => {
                Some(DisconnectReason::SSH_DISCONNECT_KEY_EXCHANGE_FAILED)
            }
            Error::HostKeyRejected => Some(DisconnectReason::SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE),
            Error::ProtocolVersion { .. } | Error::NotSSH => {
                Some(DisconnectReason::SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED)
            }
            // The transport is gone or the peer already disconnected
            Error::PeerDisconnect { .. } | Error::IoError { .. } | Error::SessionClosed => None,
            _ => Some(DisconnectReason::SSH_DISCONNECT_PROTOCOL_ERROR),
        };
        if let Some(reason) = reason {
            let mut s = TrafSend::new(&mut self.tout, &mut self.keys);
            // the peer gets the same text whatever the cause
            if self.conn.disconnect(reason, "Protocol error", &mut s).is_ok() {
                let _ = self.flush_out();
            }
        }
        self.shutdown_transport();
        e
    }

    fn shutdown_transport(&mut self) {
        self.closed = true;
        if let Err(e) = self.transport.close() {
            debug!("Closing transport: {e}");
        }
    }

    /// Writes queued output. Returns whether anything was written.
    fn flush_out(&mut self) -> Result<bool> {
        let mut wrote = false;
        while !self.tout.is_empty() {
            match self.transport.write(self.tout.pending()) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    trace!("Wrote {n}");
                    self.tout.consume(n);
                    wrote = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if wrote {
            match self.transport.flush() {
                Err(e) if e.kind() != ErrorKind::WouldBlock => return Err(e.into()),
                _ => (),
            }
        }
        Ok(wrote)
    }

    /// Performs any IO possible without blocking and handles received
    /// packets. Returns whether progress was made.
    pub fn step(&mut self) -> Result<bool> {
        self.check_open()?;
        match self.step_inner() {
            Ok(p) => Ok(p),
            Err(e) if e.is_fatal() => Err(self.fail(e)),
            Err(e) => Err(e),
        }
    }

    fn step_inner(&mut self) -> Result<bool> {
        let mut progressed = self.flush_out()?;

        if self.rx.is_empty() && !self.eof {
            let mut b = [0u8; READ_SIZE];
            match self.transport.read(&mut b) {
                Ok(0) => {
                    debug!("Transport reached end of stream");
                    self.eof = true;
                }
                Ok(n) => {
                    trace!("Read {n}");
                    self.rx.extend(&b[..n]);
                    progressed = true;
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => (),
                Err(e) => return Err(e.into()),
            }
        }

        while !self.rx.is_empty() {
            let n = self.tin.input(&mut self.keys, &mut self.remote_version, self.rx.as_slice())?;
            self.rx.consume(n);
            if self.tin.payload().is_some() {
                self.dispatch_payload()?;
                progressed = true;
            } else if n == 0 {
                break;
            }
        }

        if self.eof && self.rx.is_empty() {
            return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "connection closed by peer").into());
        }

        if self.remote_version.version().is_some() {
            let mut s = TrafSend::new(&mut self.tout, &mut self.keys);
            self.conn.progress(&mut s)?;
        }
        progressed |= self.flush_out()?;
        Ok(progressed)
    }

    fn dispatch_payload(&mut self) -> Result<()> {
        let Some((payload, seq)) = self.tin.payload() else {
            return Ok(());
        };
        let rv = self.remote_version.version().trap()?;
        let mut s = TrafSend::new(&mut self.tout, &mut self.keys);
        let r = self.conn.handle_payload(payload, seq, rv, &mut s);
        self.tin.done_payload();
        r
    }

    /// Waits on the transport until `f` is ready
    fn block_on<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<Poll<T>>) -> Result<T> {
        loop {
            if let Poll::Ready(t) = f(self)? {
                return Ok(t);
            }
            if !self.step()? {
                let want_write = !self.tout.is_empty();
                if let Err(e) = self.transport.wait(want_write) {
                    return Err(self.fail(e.into()));
                }
            }
        }
    }

    pub fn try_handshake(&mut self) -> Result<Poll<()>> {
        self.step()?;
        match self.state() {
            SessionState::Banner | SessionState::KeyExchange => Ok(Poll::Pending),
            SessionState::Closed => Err(Error::SessionClosed),
            SessionState::Authenticating | SessionState::Authenticated => Ok(Poll::Ready(())),
        }
    }

    /// Exchanges identification and completes the first key exchange.
    pub fn handshake(&mut self) -> Result<()> {
        self.block_on(|s| s.try_handshake())
    }

    /// Starts a key exchange, returning immediately. Does nothing if one
    /// is already running.
    pub fn start_rekey(&mut self) -> Result<()> {
        if !matches!(self.state(), SessionState::Authenticating | SessionState::Authenticated) {
            return Err(Error::BadUsage { msg: "handshake not complete" });
        }
        self.with_send(|c, s| c.rekey(s))?;
        self.step()?;
        Ok(())
    }

    pub fn try_rekey(&mut self) -> Result<Poll<()>> {
        self.step()?;
        if self.conn.kex_is_idle() {
            Ok(Poll::Ready(()))
        } else {
            Ok(Poll::Pending)
        }
    }

    /// Runs a key exchange to completion. The session identifier is unchanged.
    pub fn rekey(&mut self) -> Result<()> {
        self.start_rekey()?;
        self.block_on(|s| s.try_rekey())
    }

    /// Sends DISCONNECT and closes the transport. Later calls fail with
    /// [`Error::SessionClosed`].
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> Result<()> {
        self.check_open()?;
        let mut s = TrafSend::new(&mut self.tout, &mut self.keys);
        let r = self.conn.disconnect(reason, description, &mut s);
        let f = self.flush_out();
        self.shutdown_transport();
        r.and(f.map(|_| ()))
    }

    /// Closes every channel and disconnects
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.with_send(|c, s| c.channels.close_all(s))?;
        self.disconnect(DisconnectReason::SSH_DISCONNECT_BY_APPLICATION, "Closed by application")
    }

    /// Sends an IGNORE message, for traffic padding or keepalive
    pub fn send_ignore(&mut self, data: &[u8]) -> Result<()> {
        self.with_send(|c, s| c.send_ignore(data, s))?;
        self.step().map(|_| ())
    }

    pub fn send_debug(&mut self, always_display: bool, message: &str) -> Result<()> {
        self.with_send(|c, s| c.send_debug(always_display, message, s))?;
        self.step().map(|_| ())
    }

    // Client authentication

    fn cliauth(&self) -> Result<&CliAuth> {
        self.conn.cliauth_ref()
    }

    /// Methods the server listed in its last failure reply.
    /// Empty before the first reply.
    pub fn auth_methods(&self) -> Result<AuthMethods> {
        Ok(self.cliauth()?.methods())
    }

    /// The most recent banner from the server
    pub fn auth_banner(&self) -> Result<Option<&str>> {
        Ok(self.cliauth()?.banner())
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn.state() == SessionState::Authenticated && !self.closed
    }

    /// Pending keyboard-interactive prompts after [`AuthResult::NeedInfo`]
    pub fn kbdint_challenge(&self) -> Result<Option<&KbdIntChallenge>> {
        Ok(self.cliauth()?.challenge())
    }

    /// Sets the answer for prompt `index` of the current challenge
    pub fn kbdint_set_answer(&mut self, index: usize, answer: &str) -> Result<()> {
        let (auth, _) = self.conn.cliauth()?;
        auth.set_answer(index, answer)
    }

    /// Shared by the `try_auth_*` methods. `start` sends the request when
    /// `should_start` says no request is outstanding.
    fn try_auth(
        &mut self,
        should_start: impl FnOnce(&CliAuth) -> bool,
        start: impl FnOnce(&mut Conn, &mut TrafSend) -> Result<()>,
    ) -> Result<Poll<AuthResult>> {
        self.cliauth()?;
        self.step()?;
        match self.state() {
            SessionState::Banner | SessionState::KeyExchange => return Ok(Poll::Pending),
            SessionState::Closed => return Err(Error::SessionClosed),
            _ => (),
        }

        let (auth, _) = self.conn.cliauth()?;
        if let Some(r) = auth.take_result() {
            return Ok(Poll::Ready(r));
        }
        if should_start(auth) {
            self.with_send(start)?;
            self.step()?;
            let (auth, _) = self.conn.cliauth()?;
            if let Some(r) = auth.take_result() {
                return Ok(Poll::Ready(r));
            }
        }
        Ok(Poll::Pending)
    }

    fn idle(a: &CliAuth) -> bool {
        !a.in_progress()
    }

    pub fn try_auth_none(&mut self, user: &str) -> Result<Poll<AuthResult>> {
        self.try_auth(Self::idle, |c, s| {
            let (auth, ctx) = c.cliauth()?;
            auth.request_none(user, ctx, s)
        })
    }

    /// Tries the `none` method, learning the methods the server offers
    pub fn auth_none(&mut self, user: &str) -> Result<AuthResult> {
        self.block_on(|s| s.try_auth_none(user))
    }

    pub fn try_auth_password(&mut self, user: &str, password: &str) -> Result<Poll<AuthResult>> {
        self.try_auth(Self::idle, |c, s| {
            let (auth, ctx) = c.cliauth()?;
            auth.request_password(user, password, ctx, s)
        })
    }

    pub fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthResult> {
        self.block_on(|s| s.try_auth_password(user, password))
    }

    /// Offers a public key without signing. [`AuthResult::KeyAccepted`]
    /// means a signed request would be accepted.
    pub fn try_auth_pubkey_query(&mut self, user: &str, key: &dyn SignKey) -> Result<Poll<AuthResult>> {
        self.try_auth(Self::idle, |c, s| {
            let (auth, ctx) = c.cliauth()?;
            auth.request_pubkey_query(user, key, ctx, s)
        })
    }

    pub fn auth_pubkey_query(&mut self, user: &str, key: &dyn SignKey) -> Result<AuthResult> {
        self.block_on(|s| s.try_auth_pubkey_query(user, key))
    }

    /// Sends a signed public key request
    pub fn try_auth_pubkey_sign(&mut self, user: &str, key: &dyn SignKey) -> Result<Poll<AuthResult>> {
        self.try_auth(Self::idle, |c, s| {
            let sess_id = c.sess_id().trap()?.clone();
            let (auth, ctx) = c.cliauth()?;
            auth.request_pubkey_sign(user, key, &sess_id, ctx, s)
        })
    }

    pub fn auth_pubkey_sign(&mut self, user: &str, key: &dyn SignKey) -> Result<AuthResult> {
        self.block_on(|s| s.try_auth_pubkey_sign(user, key))
    }

    /// Public key authentication, querying the key before signing
    pub fn auth_pubkey(&mut self, user: &str, key: &dyn SignKey) -> Result<AuthResult> {
        match self.auth_pubkey_query(user, key)? {
            AuthResult::KeyAccepted => self.auth_pubkey_sign(user, key),
            r => Ok(r),
        }
    }

    /// Starts keyboard-interactive authentication. `submethods` is
    /// usually empty.
    pub fn try_auth_kbdint(&mut self, user: &str, submethods: &str) -> Result<Poll<AuthResult>> {
        self.try_auth(Self::idle, |c, s| {
            let (auth, ctx) = c.cliauth()?;
            auth.request_kbdint(user, submethods, ctx, s)
        })
    }

    pub fn auth_kbdint(&mut self, user: &str, submethods: &str) -> Result<AuthResult> {
        self.block_on(|s| s.try_auth_kbdint(user, submethods))
    }

    /// Sends the answers set with [`kbdint_set_answer()`](Self::kbdint_set_answer).
    /// The result may be another [`AuthResult::NeedInfo`] round.
    pub fn try_auth_kbdint_respond(&mut self) -> Result<Poll<AuthResult>> {
        let (auth, _) = self.conn.cliauth()?;
        if auth.challenge().is_none() && !auth.in_progress() {
            return Err(Error::BadUsage { msg: "no keyboard-interactive prompts" });
        }
        self.try_auth(
            |a| a.challenge().is_some(),
            |c, s| {
                let (auth, _) = c.cliauth()?;
                auth.respond(s)
            },
        )
    }

    pub fn auth_kbdint_respond(&mut self) -> Result<AuthResult> {
        self.block_on(|s| s.try_auth_kbdint_respond())
    }

    // Channels

    fn check_authed(&self) -> Result<()> {
        self.check_open()?;
        if self.conn.state() != SessionState::Authenticated {
            return Err(Error::BadUsage { msg: "not authenticated" });
        }
        Ok(())
    }

    /// Sends a channel open, returning immediately. Completion is checked
    /// with [`poll_channel_open()`](Self::poll_channel_open).
    pub fn try_channel_open(&mut self, kind: ChanKind) -> Result<ChanNum> {
        self.check_authed()?;
        let num = self.with_send(|c, s| c.channels.open(kind, s))?;
        self.step()?;
        Ok(num)
    }

    /// A refused open fails with [`Error::ChannelOpenFailed`] and frees the number.
    pub fn poll_channel_open(&mut self, num: ChanNum) -> Result<Poll<()>> {
        self.step()?;
        self.conn.channels.poll_open(num)
    }

    pub fn channel_open(&mut self, kind: ChanKind) -> Result<ChanNum> {
        let num = self.try_channel_open(kind)?;
        self.block_on(|s| s.poll_channel_open(num))?;
        Ok(num)
    }

    pub fn channel_open_session(&mut self) -> Result<ChanNum> {
        self.channel_open(ChanKind::Session)
    }

    /// Opens a `direct-tcpip` channel, forwarding to `address:port`
    pub fn channel_direct_tcpip(
        &mut self,
        address: &str,
        port: u32,
        origin: &str,
        origin_port: u32,
    ) -> Result<ChanNum> {
        self.channel_open(ChanKind::DirectTcpip {
            address: address.into(),
            port,
            origin: origin.into(),
            origin_port,
        })
    }

    /// Sends as much as the peer's window allows. `Pending` when the window
    /// is exhausted.
    pub fn try_channel_write(&mut self, num: ChanNum, dt: ChanData, data: &[u8]) -> Result<Poll<usize>> {
        self.check_authed()?;
        self.step()?;
        let n = self.with_send(|c, s| c.channels.write(num, dt, data, s))?;
        self.step()?;
        if n == 0 && !data.is_empty() {
            Ok(Poll::Pending)
        } else {
            Ok(Poll::Ready(n))
        }
    }

    /// Writes all of `data`, waiting for window space as needed.
    pub fn channel_write(&mut self, num: ChanNum, dt: ChanData, data: &[u8]) -> Result<usize> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self.block_on(|s| s.try_channel_write(num, dt, &data[sent..]))?;
        }
        Ok(sent)
    }

    /// The peer's current window for a channel
    pub fn channel_send_window(&self, num: ChanNum) -> Result<u32> {
        self.conn.channels.send_window(num)
    }

    /// Reads buffered data. `Ready(0)` means EOF.
    pub fn try_channel_read(&mut self, num: ChanNum, dt: ChanData, buf: &mut [u8]) -> Result<Poll<usize>> {
        self.check_open()?;
        self.step()?;
        let n = self.with_send(|c, s| c.channels.read(num, dt, buf, s, &mut c.events))?;
        if n > 0 {
            // window adjust
            self.step()?;
            return Ok(Poll::Ready(n));
        }
        match self.conn.channels.poll(num, dt)? {
            None => Ok(Poll::Ready(0)),
            Some(_) if buf.is_empty() => Ok(Poll::Ready(0)),
            Some(_) => Ok(Poll::Pending),
        }
    }

    /// Waits for data, returning 0 at EOF.
    pub fn channel_read(&mut self, num: ChanNum, dt: ChanData, buf: &mut [u8]) -> Result<usize> {
        self.block_on(|s| s.try_channel_read(num, dt, buf))
    }

    /// Bytes available to read without waiting, `None` once at EOF
    pub fn channel_poll(&mut self, num: ChanNum, dt: ChanData) -> Result<Option<usize>> {
        self.step()?;
        self.conn.channels.poll(num, dt)
    }

    /// EOF was received and all data has been read
    pub fn channel_is_eof(&self, num: ChanNum) -> Result<bool> {
        self.conn.channels.is_eof(num)
    }

    /// The peer closed the channel and all data has been read
    pub fn channel_is_closed(&self, num: ChanNum) -> Result<bool> {
        self.conn.channels.is_closed(num)
    }

    pub fn channel_exit_status(&self, num: ChanNum) -> Result<Option<u32>> {
        self.conn.channels.exit_status(num)
    }

    pub fn channel_exit_signal(&self, num: ChanNum) -> Result<Option<ExitSignal>> {
        self.conn.channels.exit_signal(num)
    }

    pub fn channel_send_eof(&mut self, num: ChanNum) -> Result<()> {
        self.with_send(|c, s| c.channels.send_eof(num, s))?;
        self.step().map(|_| ())
    }

    /// Sends EOF and CLOSE. The number stays allocated until
    /// [`channel_free()`](Self::channel_free).
    pub fn channel_close(&mut self, num: ChanNum) -> Result<()> {
        self.with_send(|c, s| c.channels.close(num, s))?;
        self.step().map(|_| ())
    }

    /// Closes the channel if needed and releases its number. Unread data is discarded.
    pub fn channel_free(&mut self, num: ChanNum) -> Result<()> {
        self.with_send(|c, s| c.channels.free(num, s))?;
        self.step().map(|_| ())
    }

    /// Waits until one of `nums` is readable, exceptional or, with
    /// `want_write`, writable. A `timeout` of `None` waits indefinitely,
    /// an expired timeout returns an empty list.
    pub fn channel_select(
        &mut self,
        nums: &[ChanNum],
        want_write: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<ChanReady>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.block_on(|s| {
            s.step()?;
            let mut ready = vec![];
            for num in nums {
                let mut r = s.conn.channels.ready(*num)?;
                r.writable &= want_write;
                if r.any() {
                    ready.push(r);
                }
            }
            if !ready.is_empty() || deadline.is_some_and(|d| Instant::now() >= d) {
                Ok(Poll::Ready(ready))
            } else {
                Ok(Poll::Pending)
            }
        })
    }

    /// Sends a request wanting a reply, check with
    /// [`poll_channel_request()`](Self::poll_channel_request).
    pub fn try_channel_request(&mut self, num: ChanNum, req: &ChanRequest) -> Result<ReqId> {
        self.check_authed()?;
        let id = self.with_send(|c, s| c.channels.request(num, req, true, s))?;
        self.step()?;
        id.trap()
    }

    /// A refused request is [`Error::RequestDenied`], the channel remains usable.
    pub fn poll_channel_request(&mut self, num: ChanNum, id: ReqId) -> Result<Poll<()>> {
        self.step()?;
        self.conn.channels.poll_request(num, id)
    }

    /// Sends a request and waits for the reply
    pub fn channel_request(&mut self, num: ChanNum, req: &ChanRequest) -> Result<()> {
        let id = self.try_channel_request(num, req)?;
        self.block_on(|s| s.poll_channel_request(num, id))
    }

    /// Sends a request without asking for a reply
    pub fn channel_request_noreply(&mut self, num: ChanNum, req: &ChanRequest) -> Result<()> {
        self.check_authed()?;
        self.with_send(|c, s| c.channels.request(num, req, false, s))?;
        self.step().map(|_| ())
    }

    pub fn channel_pty(&mut self, num: ChanNum, pty: &Pty) -> Result<()> {
        self.channel_request(num, &ChanRequest::Pty(pty.clone()))
    }

    pub fn channel_shell(&mut self, num: ChanNum) -> Result<()> {
        self.channel_request(num, &ChanRequest::Shell)
    }

    pub fn channel_exec(&mut self, num: ChanNum, command: &str) -> Result<()> {
        self.channel_request(num, &ChanRequest::Exec { command: command.into() })
    }

    pub fn channel_subsystem(&mut self, num: ChanNum, name: &str) -> Result<()> {
        self.channel_request(num, &ChanRequest::Subsystem { name: name.into() })
    }

    pub fn channel_env(&mut self, num: ChanNum, name: &str, value: &str) -> Result<()> {
        self.channel_request(num, &ChanRequest::Env { name: name.into(), value: value.into() })
    }

    pub fn channel_window_change(&mut self, num: ChanNum, cols: u32, rows: u32) -> Result<()> {
        let req = ChanRequest::WindowChange { cols, rows, width: 0, height: 0 };
        self.channel_request_noreply(num, &req)
    }

    /// Sends a signal, the name without "SIG"
    pub fn channel_signal(&mut self, num: ChanNum, name: &str) -> Result<()> {
        self.channel_request_noreply(num, &ChanRequest::Signal { name: name.into() })
    }

    /// Server side, reports a command's exit status
    pub fn channel_send_exit_status(&mut self, num: ChanNum, status: u32) -> Result<()> {
        if self.is_client() {
            return Err(Error::BadUsage { msg: "exit-status is sent by servers" });
        }
        self.channel_request_noreply(num, &ChanRequest::ExitStatus(status))
    }

    pub fn channel_send_exit_signal(&mut self, num: ChanNum, sig: &ExitSignal) -> Result<()> {
        if self.is_client() {
            return Err(Error::BadUsage { msg: "exit-signal is sent by servers" });
        }
        self.channel_request_noreply(num, &ChanRequest::ExitSignal(sig.clone()))
    }

    // Global requests

    pub fn try_global_request(&mut self, req: &GlobalReq) -> Result<ReqId> {
        self.check_authed()?;
        let id = self.with_send(|c, s| c.globals.send(req, true, s))?;
        self.step()?;
        id.trap()
    }

    /// `Ready` with any port the peer bound
    pub fn poll_global_request(&mut self, id: ReqId) -> Result<Poll<Option<u32>>> {
        self.step()?;
        self.conn.globals.poll(id)
    }

    pub fn global_request(&mut self, req: &GlobalReq) -> Result<Option<u32>> {
        let id = self.try_global_request(req)?;
        self.block_on(|s| s.poll_global_request(id))
    }

    /// Asks the server to listen on `address:port`, returning the bound
    /// port. Port 0 lets the server choose.
    pub fn tcpip_forward(&mut self, address: &str, port: u32) -> Result<u32> {
        let bound = self.global_request(&GlobalReq::TcpipForward { address: address.into(), port })?;
        Ok(bound.unwrap_or(port))
    }

    pub fn cancel_tcpip_forward(&mut self, address: &str, port: u32) -> Result<()> {
        self.global_request(&GlobalReq::CancelTcpipForward { address: address.into(), port })?;
        Ok(())
    }

    // Events

    pub fn try_next_event(&mut self) -> Result<Poll<Event>> {
        self.check_open()?;
        if let Some(e) = self.conn.events.pop_front() {
            return Ok(Poll::Ready(e));
        }
        self.step()?;
        Ok(match self.conn.events.pop_front() {
            Some(e) => Poll::Ready(e),
            None => Poll::Pending,
        })
    }

    /// Waits for the next event. Servers run their connection by calling this.
    pub fn next_event(&mut self) -> Result<Event> {
        self.block_on(|s| s.try_next_event())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut s = TrafSend::new(&mut self.tout, &mut self.keys);
        let _ = self.conn.channels.close_all(&mut s);
        let _ = self.conn.disconnect(
            DisconnectReason::SSH_DISCONNECT_BY_APPLICATION,
            "Session closed",
            &mut s,
        );
        let _ = self.flush_out();
        self.shutdown_transport();
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.is_client())
            .field("state", &self.state())
            .field("remote_version", &self.remote_version())
            .finish_non_exhaustive()
    }
}
