//! Represents the state of a SSH connection.
//!
//! `Conn` routes each incoming payload to the key exchange, authentication
//! or channel code. It performs no IO, responses are queued with [`TrafSend`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use pretty_hex::PrettyHex;

use crate::behaviour::Behaviour;
use crate::channel::{Channels, GlobalRequests};
use crate::cliauth::CliAuth;
use crate::client::ClientHandler;
use crate::config::SshConfig;
use crate::event::Event;
use crate::kex::{AlgoConfig, Kex, Negotiated, SessId};
use crate::packets::{self, Category, Packet, ParseContext};
use crate::servauth::ServAuth;
use crate::server::ServerHandler;
use crate::sign::SignKey;
use crate::sshnames::*;
use crate::sshwire;
use crate::traffic::TrafSend;

/// Progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the peer's identification line
    Banner,
    /// The first key exchange is running
    KeyExchange,
    /// Keys are established, the user isn't authenticated yet
    Authenticating,
    Authenticated,
    /// A fatal error or disconnect ended the session
    Closed,
}

/// Role specific state
pub(crate) enum CliServ {
    Client {
        auth: CliAuth,
        handler: Box<dyn ClientHandler>,
    },
    Server {
        auth: ServAuth,
        hostkeys: Vec<Box<dyn SignKey>>,
        handler: Box<dyn ServerHandler>,
        service_accepted: bool,
    },
}

impl CliServ {
    fn behaviour(&mut self) -> Behaviour<'_> {
        match self {
            Self::Client { handler, .. } => Behaviour::Client(handler.as_mut()),
            Self::Server { handler, .. } => Behaviour::Server(handler.as_mut()),
        }
    }
}

/// The core state of a SSH instance.
pub(crate) struct Conn {
    /// Never `Banner` or `Closed`, those are tracked by the session
    state: SessionState,

    // State of any current Key Exchange
    kex: Kex,

    sess_id: Option<SessId>,

    pub(crate) cliserv: CliServ,

    algo_conf: AlgoConfig,
    pub(crate) config: SshConfig,
    our_version: String,

    pub(crate) parse_ctx: ParseContext,

    pub(crate) channels: Channels,
    pub(crate) globals: GlobalRequests,
    pub(crate) events: VecDeque<Event>,

    /// Host key blob from the first key exchange, clients only
    peer_hostkey: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,

    disconnect_sent: bool,
}

impl Conn {
    /// `config` must already be validated
    pub fn new(config: SshConfig, cliserv: CliServ) -> Result<Self> {
        let hostkeys = match &cliserv {
            CliServ::Server { hostkeys, .. } => Some(hostkeys.as_slice()),
            CliServ::Client { .. } => None,
        };
        let algo_conf = AlgoConfig::new(&config, hostkeys)?;
        let is_client = matches!(cliserv, CliServ::Client { .. });
        Ok(Conn {
            state: SessionState::KeyExchange,
            kex: Kex::new(),
            sess_id: None,
            algo_conf,
            our_version: crate::ident::our_version(&config.version),
            channels: Channels::new(is_client, config.window, config.max_packet),
            globals: GlobalRequests::default(),
            events: VecDeque::new(),
            parse_ctx: ParseContext::new(),
            peer_hostkey: None,
            negotiated: None,
            disconnect_sent: false,
            cliserv,
            config,
        })
    }

    /// Our identification line without CR LF
    pub fn our_version(&self) -> &str {
        &self.our_version
    }

    /// Sends our KEXINIT straight after the identification line,
    /// saving a round trip.
    pub fn start(&mut self, s: &mut TrafSend) -> Result<()> {
        self.kex.send_kexinit(&self.algo_conf, self.config.provider.as_ref(), s)
    }

    pub fn is_client(&self) -> bool {
        matches!(self.cliserv, CliServ::Client { .. })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sess_id(&self) -> Option<&SessId> {
        self.sess_id.as_ref()
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn peer_hostkey(&self) -> Option<&[u8]> {
        self.peer_hostkey.as_deref()
    }

    pub fn kex_is_idle(&self) -> bool {
        self.kex.is_idle()
    }

    /// Client authentication state and the parse context it updates
    pub fn cliauth(&mut self) -> Result<(&mut CliAuth, &mut ParseContext)> {
        match &mut self.cliserv {
            CliServ::Client { auth, .. } => Ok((auth, &mut self.parse_ctx)),
            CliServ::Server { .. } => Err(Error::BadUsage { msg: "not a client" }),
        }
    }

    pub fn cliauth_ref(&self) -> Result<&CliAuth> {
        match &self.cliserv {
            CliServ::Client { auth, .. } => Ok(auth),
            CliServ::Server { .. } => Err(Error::BadUsage { msg: "not a client" }),
        }
    }

    /// Begins a key exchange if none is running
    pub fn rekey(&mut self, s: &mut TrafSend) -> Result<()> {
        if self.state == SessionState::KeyExchange || !self.kex.is_idle() {
            trace!("Key exchange already running");
            return Ok(());
        }
        info!("Starting rekey");
        self.kex.send_kexinit(&self.algo_conf, self.config.provider.as_ref(), s)
    }

    /// Periodic work after handling input, currently the rekey limit.
    pub fn progress(&mut self, s: &mut TrafSend) -> Result<()> {
        if self.kex.is_idle()
            && self.state != SessionState::KeyExchange
            && s.rekey_due(self.config.rekey_bytes)
        {
            debug!("Rekey limit of {} bytes reached", self.config.rekey_bytes);
            self.rekey(s)?;
        }
        Ok(())
    }

    /// Sends DISCONNECT, once.
    pub fn disconnect(&mut self, reason: DisconnectReason, desc: &str, s: &mut TrafSend) -> Result<()> {
        if self.disconnect_sent {
            return Ok(());
        }
        self.disconnect_sent = true;
        info!("Disconnecting, {reason:?} {desc}");
        s.send(packets::Disconnect { reason: reason as u32, desc: desc.into(), lang: "".into() })
    }

    pub fn disconnect_sent(&self) -> bool {
        self.disconnect_sent
    }

    pub fn send_ignore(&mut self, data: &[u8], s: &mut TrafSend) -> Result<()> {
        s.send(packets::Ignore { data: sshwire::BinString(data) })
    }

    pub fn send_debug(&mut self, always_display: bool, message: &str, s: &mut TrafSend) -> Result<()> {
        s.send(packets::DebugPacket { always_display, message: message.into(), lang: "" })
    }

    /// Consumes an input payload. `remote_version` is the peer's
    /// identification line, for the exchange hash.
    pub fn handle_payload(
        &mut self,
        payload: &[u8],
        seq: u32,
        remote_version: &str,
        s: &mut TrafSend,
    ) -> Result<()> {
        match sshwire::packet_from_bytes(payload, &self.parse_ctx) {
            Ok(p) => {
                let num = p.message_num() as u8;
                let r = self.dispatch_packet(p, payload, remote_version, s);
                if let Err(Error::SSHProtoError | Error::PacketWrong) = r {
                    debug!("Error handling {num} packet");
                }
                r
            }
            Err(Error::UnknownPacket { number }) => {
                debug!("Unimplemented packet type {number}");
                s.send(packets::Unimplemented { seq })
            }
            Err(e) => {
                debug!("Error decoding packet: {e}");
                trace!("Input:\n{:?}", payload.hex_dump());
                Err(e)
            }
        }
    }

    /// Check that a packet is received in the correct state
    fn check_packet(&self, p: &Packet) -> Result<()> {
        let ok = match p.category() {
            Category::All => true,
            Category::Kex => true,
            // Between KEXINITs and NEWKEYS only transport messages are allowed
            _ if !matches!(self.kex, Kex::Idle | Kex::KexInit { .. }) => false,
            Category::Auth => self.state != SessionState::KeyExchange,
            Category::Sess => self.state == SessionState::Authenticated,
        };
        if ok {
            Ok(())
        } else {
            debug!("Received unexpected packet {}", p.message_num() as u8);
            trace!("state is {:?}, kex {:?}", self.state, self.kex);
            Err(Error::SSHProtoError)
        }
    }

    fn dispatch_packet(
        &mut self,
        packet: Packet,
        payload: &[u8],
        remote_version: &str,
        s: &mut TrafSend,
    ) -> Result<()> {
        trace!("Incoming {packet:?}");
        self.check_packet(&packet)?;
        let is_client = self.is_client();

        match packet {
            Packet::KexInit(k) => {
                self.kex.handle_kexinit(
                    &k,
                    payload,
                    is_client,
                    &self.algo_conf,
                    self.config.provider.as_ref(),
                    &self.our_version,
                    remote_version,
                    s,
                )?;
            }
            Packet::KexDHInit(p) => {
                let CliServ::Server { hostkeys, .. } = &self.cliserv else {
                    debug!("Received KEXDH_INIT as a client");
                    return Err(Error::SSHProtoError);
                };
                self.kex.handle_kexdhinit(
                    &p,
                    hostkeys,
                    self.config.provider.as_ref(),
                    &mut self.sess_id,
                    s,
                )?;
            }
            Packet::KexDHReply(p) => {
                let CliServ::Client { handler, .. } = &mut self.cliserv else {
                    debug!("Received KEXDH_REPLY as a server");
                    return Err(Error::SSHProtoError);
                };
                if let Some(prev) = &self.peer_hostkey {
                    if prev.as_slice() != p.k_s.0 {
                        info!("Host key changed during rekey");
                        return Err(Error::HostKeyRejected);
                    }
                }
                self.kex.handle_kexdhreply(
                    &p,
                    self.config.provider.as_ref(),
                    handler.as_mut(),
                    &mut self.sess_id,
                    s,
                )?;
                if self.peer_hostkey.is_none() {
                    self.peer_hostkey = Some(p.k_s.0.to_vec());
                }
            }
            Packet::NewKeys(_) => {
                let n = self.kex.handle_newkeys(s)?;
                info!("Key exchange complete: {n}");
                self.negotiated = Some(n);
                if self.state == SessionState::KeyExchange {
                    self.state = SessionState::Authenticating;
                }
            }
            Packet::ServiceRequest(p) => {
                let CliServ::Server { service_accepted, .. } = &mut self.cliserv else {
                    debug!("Server sent a service request");
                    return Err(Error::SSHProtoError);
                };
                if p.name == SSH_SERVICE_USERAUTH && !*service_accepted {
                    *service_accepted = true;
                    s.send(packets::ServiceAccept { name: SSH_SERVICE_USERAUTH })?;
                } else {
                    info!("Refusing service '{}'", p.name);
                    self.disconnect(
                        DisconnectReason::SSH_DISCONNECT_SERVICE_NOT_AVAILABLE,
                        "Service not available",
                        s,
                    )?;
                    return Err(Error::SSHProtoUnsupported);
                }
            }
            Packet::ServiceAccept(p) => {
                let (auth, _) = self.cliauth().map_err(|_| Error::SSHProtoError)?;
                auth.service_accept(&p)?;
            }
            Packet::Ignore(_) => {
                // nothing to do
            }
            Packet::Unimplemented(p) => {
                warn!("Peer reports unimplemented message, seq {}", p.seq);
            }
            Packet::DebugPacket(p) => {
                let level = match p.always_display {
                    true => log::Level::Info,
                    false => log::Level::Debug,
                };
                log!(level, "SSH debug message from remote host: {}", p.message.to_string_lossy());
            }
            Packet::Disconnect(p) => {
                let desc = p.desc.to_string_lossy();
                info!("Peer disconnected, reason {}: {desc}", p.reason);
                return Err(Error::PeerDisconnect { reason: p.reason, desc });
            }
            Packet::UserauthRequest(p) => {
                let CliServ::Server { auth, handler, service_accepted, .. } = &mut self.cliserv else {
                    debug!("Server sent an auth request");
                    return Err(Error::SSHProtoError);
                };
                if !*service_accepted {
                    debug!("Auth request before service request");
                    return Err(Error::SSHProtoError);
                }
                let sess_id = self.sess_id.as_ref().trap()?;
                let r = auth.request(
                    p,
                    sess_id,
                    self.config.provider.as_ref(),
                    s,
                    handler.as_mut(),
                    &mut self.events,
                );
                if auth.exhausted() {
                    self.disconnect_sent = true;
                }
                r?;
                if auth.authed {
                    self.state = SessionState::Authenticated;
                }
            }
            Packet::UserauthInfoResponse(p) => {
                let CliServ::Server { auth, handler, .. } = &mut self.cliserv else {
                    debug!("Server sent an info response");
                    return Err(Error::SSHProtoError);
                };
                let r = auth.info_response(&p, s, handler.as_mut(), &mut self.events);
                if auth.exhausted() {
                    self.disconnect_sent = true;
                }
                r?;
                if auth.authed {
                    self.state = SessionState::Authenticated;
                }
            }
            Packet::UserauthFailure(p) => {
                let (auth, ctx) = self.cliauth().map_err(|_| Error::SSHProtoError)?;
                auth.failure(&p, ctx)?;
            }
            Packet::UserauthSuccess(_) => {
                let (auth, ctx) = self.cliauth().map_err(|_| Error::SSHProtoError)?;
                let user = auth.success(ctx, s)?;
                self.state = SessionState::Authenticated;
                self.events.push_back(Event::Authenticated { user });
            }
            Packet::UserauthBanner(p) => {
                let (auth, _) = self.cliauth().map_err(|_| Error::SSHProtoError)?;
                let message = auth.set_banner(&p);
                self.events.push_back(Event::Banner { message });
            }
            Packet::Userauth60(p) => {
                let (auth, ctx) = self.cliauth().map_err(|_| Error::SSHProtoError)?;
                auth.auth60(&p, ctx)?;
            }
            Packet::ChannelOpen(_)
            | Packet::ChannelOpenConfirmation(_)
            | Packet::ChannelOpenFailure(_)
            | Packet::ChannelWindowAdjust(_)
            | Packet::ChannelData(_)
            | Packet::ChannelDataExt(_)
            | Packet::ChannelEof(_)
            | Packet::ChannelClose(_)
            | Packet::ChannelRequest(_)
            | Packet::ChannelSuccess(_)
            | Packet::ChannelFailure(_) => {
                let mut b = self.cliserv.behaviour();
                self.channels.dispatch(packet, s, &mut b, &mut self.events)?;
            }
            Packet::GlobalRequest(p) => {
                let mut b = self.cliserv.behaviour();
                self.globals.dispatch_request(&p, s, &mut b, &mut self.events)?;
            }
            Packet::RequestSuccess(p) => {
                trace!("Got global request success");
                self.globals.handle_reply(Some(p.bound_port))?;
            }
            Packet::RequestFailure(_) => {
                trace!("Got global request failure");
                self.globals.handle_reply(None)?;
            }
        };
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::client::AcceptAnyHostkey;
    use crate::conn::*;
    use crate::encrypt::tests::{algo_combos, keyed_pair};
    use crate::encrypt::KeyState;
    use crate::ident::RemoteVersion;
    use crate::server::ServerHandler;
    use crate::sign::KeyPair;
    use crate::sshlog::init_test_log;
    use crate::traffic::{TrafIn, TrafOut};

    struct NoAuth;
    impl ServerHandler for NoAuth {}

    fn server() -> Conn {
        let hostkeys: Vec<Box<dyn SignKey>> = vec![Box::new(KeyPair::from_ed25519_seed(&[7u8; 32]))];
        let cs = CliServ::Server {
            auth: ServAuth::new(),
            hostkeys,
            handler: Box::new(NoAuth),
            service_accepted: false,
        };
        Conn::new(SshConfig::default(), cs).unwrap()
    }

    /// Keyed output, and a decoder for what was sent
    struct Wire {
        out: TrafOut,
        keys: KeyState,
        dec_keys: KeyState,
        tin: TrafIn,
        rv: RemoteVersion,
    }

    impl Wire {
        fn new() -> Self {
            let (keys, dec_keys) = keyed_pair(&algo_combos().remove(0));
            let mut rv = RemoteVersion::new(true);
            rv.consume(b"SSH-2.0-x\r\n").unwrap();
            Self { out: TrafOut::new(), keys, dec_keys, tin: TrafIn::new(), rv }
        }

        fn s(&mut self) -> TrafSend<'_> {
            TrafSend::new(&mut self.out, &mut self.keys)
        }

        /// Message numbers of sent packets
        fn sent(&mut self) -> Vec<u8> {
            let mut nums = vec![];
            let data = self.out.pending().to_vec();
            self.out.consume(data.len());
            let mut d = data.as_slice();
            while !d.is_empty() {
                let n = self.tin.input(&mut self.dec_keys, &mut self.rv, d).unwrap();
                d = &d[n..];
                if let Some((p, _)) = self.tin.payload() {
                    nums.push(p[0]);
                    self.tin.done_payload();
                }
            }
            nums
        }
    }

    fn encode(p: Packet) -> Vec<u8> {
        sshwire::write_ssh_vec(&p).unwrap()
    }

    #[test]
    fn unknown_message_gets_unimplemented() {
        init_test_log();
        let mut c = server();
        let mut w = Wire::new();
        c.handle_payload(&[199, 1, 2], 17, "SSH-2.0-x", &mut w.s()).unwrap();
        assert_eq!(w.sent(), vec![packets::MessageNumber::SSH_MSG_UNIMPLEMENTED as u8]);
    }

    #[test]
    fn peer_disconnect() {
        init_test_log();
        let mut c = server();
        let mut w = Wire::new();
        let p = encode(
            packets::Disconnect { reason: 11, desc: "bye".into(), lang: "".into() }.into(),
        );
        let e = c.handle_payload(&p, 0, "SSH-2.0-x", &mut w.s()).unwrap_err();
        assert!(matches!(e, Error::PeerDisconnect { reason: 11, ref desc } if desc == "bye"));
        assert!(e.is_fatal());
    }

    #[test]
    fn ignore_and_debug_any_time() {
        init_test_log();
        let mut c = server();
        let mut w = Wire::new();
        let p = encode(packets::Ignore { data: sshwire::BinString(b"pad") }.into());
        c.handle_payload(&p, 0, "SSH-2.0-x", &mut w.s()).unwrap();
        let p = encode(
            packets::DebugPacket { always_display: true, message: "hi".into(), lang: "" }.into(),
        );
        c.handle_payload(&p, 1, "SSH-2.0-x", &mut w.s()).unwrap();
        assert!(w.sent().is_empty());
    }

    #[test]
    fn early_packets_rejected() {
        init_test_log();
        let mut c = server();
        let mut w = Wire::new();
        // before the first key exchange
        let p = encode(packets::ServiceRequest { name: SSH_SERVICE_USERAUTH }.into());
        assert!(matches!(
            c.handle_payload(&p, 0, "SSH-2.0-x", &mut w.s()),
            Err(Error::SSHProtoError)
        ));
        let p = encode(packets::ChannelEof { num: 0 }.into());
        assert!(matches!(
            c.handle_payload(&p, 1, "SSH-2.0-x", &mut w.s()),
            Err(Error::SSHProtoError)
        ));
    }

    #[test]
    fn unknown_service_disconnects() {
        init_test_log();
        let mut c = server();
        c.state = SessionState::Authenticating;
        let mut w = Wire::new();
        let p = encode(packets::ServiceRequest { name: "ssh-frobnicate" }.into());
        let e = c.handle_payload(&p, 0, "SSH-2.0-x", &mut w.s()).unwrap_err();
        assert!(matches!(e, Error::SSHProtoUnsupported));
        assert!(c.disconnect_sent());
        assert_eq!(w.sent(), vec![packets::MessageNumber::SSH_MSG_DISCONNECT as u8]);

        let mut c = server();
        c.state = SessionState::Authenticating;
        let p = encode(packets::ServiceRequest { name: SSH_SERVICE_USERAUTH }.into());
        c.handle_payload(&p, 0, "SSH-2.0-x", &mut w.s()).unwrap();
        assert_eq!(w.sent(), vec![packets::MessageNumber::SSH_MSG_SERVICE_ACCEPT as u8]);
    }

    #[test]
    fn disconnect_sent_once() {
        init_test_log();
        let cs = CliServ::Client { auth: CliAuth::new(), handler: Box::new(AcceptAnyHostkey) };
        let mut c = Conn::new(SshConfig::default(), cs).unwrap();
        let mut w = Wire::new();
        c.disconnect(DisconnectReason::SSH_DISCONNECT_BY_APPLICATION, "done", &mut w.s()).unwrap();
        c.disconnect(DisconnectReason::SSH_DISCONNECT_BY_APPLICATION, "done", &mut w.s()).unwrap();
        assert_eq!(w.sent().len(), 1);
    }
}
