//! Server side user authentication, RFC4252 and RFC4256.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use crate::auth::{AuthDecision, AuthMethods, AuthSigMsg, KbdIntChallenge, KbdIntReply};
use crate::config::{MAX_AUTH_ATTEMPTS, MAX_USERNAME};
use crate::crypto::CryptoProvider;
use crate::event::Event;
use crate::kex::SessId;
use crate::namelist::LocalNames;
use crate::packets::{self, AuthMethod, Userauth60, UserauthRequest};
use crate::server::ServerHandler;
use crate::sign::split_sig_blob;
use crate::sshnames::*;
use crate::sshwire;
use crate::traffic::TrafSend;

/// What to send in reply to a request
enum Reply {
    Decision(AuthDecision),
    Prompts(KbdIntChallenge),
    /// A reply (PK_OK) has already been sent
    Sent,
}

impl From<KbdIntReply> for Reply {
    fn from(r: KbdIntReply) -> Self {
        match r {
            KbdIntReply::Prompts(c) => Reply::Prompts(c),
            KbdIntReply::Decision(d) => Reply::Decision(d),
        }
    }
}

pub(crate) struct ServAuth {
    pub authed: bool,
    banner_sent: bool,
    /// Failed requests so far
    attempts: u32,
    /// The current request is a `none` method query
    none_request: bool,
    /// Username of a keyboard-interactive exchange awaiting INFO_RESPONSE
    kbdint_user: Option<String>,
}

impl ServAuth {
    pub fn new() -> Self {
        Self { authed: false, banner_sent: false, attempts: 0, none_request: false, kbdint_user: None }
    }

    /// The attempt limit was reached and DISCONNECT has been sent
    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_AUTH_ATTEMPTS
    }

    pub fn request(
        &mut self,
        p: UserauthRequest,
        sess_id: &SessId,
        provider: &dyn CryptoProvider,
        s: &mut TrafSend,
        b: &mut dyn ServerHandler,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        if self.authed {
            debug!("Ignoring userauth request after success");
            return Ok(());
        }
        // A new request abandons a keyboard-interactive exchange
        self.kbdint_user = None;
        self.none_request = false;

        let username = match p.username.as_str() {
            Ok(u) if u.len() <= MAX_USERNAME => u,
            _ => {
                debug!("Bad username {:?}", p.username);
                return self.reply(Reply::Decision(AuthDecision::Deny), "", AuthMethods::empty(), s, events);
            }
        };

        if !self.banner_sent {
            self.banner_sent = true;
            if let Some(m) = b.auth_banner(username) {
                s.send(packets::UserauthBanner { message: m.as_str().into(), lang: "".into() })?;
            }
        }

        let methods = b.auth_methods(username);
        let reply = if p.service != SSH_SERVICE_CONNECTION {
            debug!("Userauth for unknown service '{}'", p.service);
            Reply::Decision(AuthDecision::Deny)
        } else {
            self.method(&p, username, methods, sess_id, provider, s, b)?
        };
        self.reply(reply, username, methods, s, events)
    }

    #[allow(clippy::too_many_arguments)]
    fn method(
        &mut self,
        p: &UserauthRequest,
        username: &str,
        methods: AuthMethods,
        sess_id: &SessId,
        provider: &dyn CryptoProvider,
        s: &mut TrafSend,
        b: &mut dyn ServerHandler,
    ) -> Result<Reply> {
        let d = match &p.method {
            AuthMethod::None => {
                self.none_request = true;
                b.auth_none(username)
            }
            AuthMethod::Password(m) if methods.contains(AuthMethods::PASSWORD) => {
                if m.new.is_some() {
                    debug!("Password change not supported");
                    AuthDecision::Deny
                } else {
                    match m.password.as_str() {
                        Ok(pw) => b.auth_password(username, pw),
                        Err(_) => AuthDecision::Deny,
                    }
                }
            }
            AuthMethod::PubKey(m) if methods.contains(AuthMethods::PUBLICKEY) => {
                let Some(sig) = &m.sig else {
                    if b.auth_pubkey_acceptable(username, m.sig_algo, m.pubkey.0) {
                        s.send(Userauth60::PkOk(packets::UserauthPkOk {
                            algo: m.sig_algo,
                            key: m.pubkey.clone(),
                        }))?;
                        return Ok(Reply::Sent);
                    }
                    return Ok(Reply::Decision(AuthDecision::Deny));
                };
                if Self::verify_sig(p, m, sig.0, sess_id, provider) {
                    b.auth_pubkey(username, m.sig_algo, m.pubkey.0)
                } else {
                    AuthDecision::Deny
                }
            }
            AuthMethod::KbdInt(m) if methods.contains(AuthMethods::INTERACTIVE) => {
                let sub = m.submethods.to_string_lossy();
                return Ok(b.auth_kbdint(username, &sub).into());
            }
            AuthMethod::Unknown(u) => {
                debug!("Request for unknown auth method {u}");
                AuthDecision::Deny
            }
            m => {
                debug!("Auth method {:?} not offered", m);
                AuthDecision::Deny
            }
        };
        Ok(Reply::Decision(d))
    }

    /// Checks the signature of a publickey request
    fn verify_sig(
        p: &UserauthRequest,
        m: &packets::MethodPubKey,
        sig: &[u8],
        sess_id: &SessId,
        provider: &dyn CryptoProvider,
    ) -> bool {
        match split_sig_blob(sig) {
            Ok((algo, _)) if algo == m.sig_algo => (),
            _ => {
                debug!("Signature algorithm doesn't match {}", m.sig_algo);
                return false;
            }
        }

        // The signed message is the request without its signature
        let unsigned = UserauthRequest {
            username: p.username.clone(),
            service: p.service,
            method: AuthMethod::PubKey(packets::MethodPubKey {
                sig_algo: m.sig_algo,
                pubkey: m.pubkey.clone(),
                sig: None,
                force_sig: true,
            }),
        };
        let Ok(msg) = sshwire::write_ssh_vec(&AuthSigMsg::new(&unsigned, sess_id)) else {
            return false;
        };
        match provider.verify(m.sig_algo, m.pubkey.0, &msg, sig) {
            Ok(()) => true,
            Err(e) => {
                debug!("Userauth signature failed: {e}");
                false
            }
        }
    }

    pub fn info_response(
        &mut self,
        p: &packets::UserauthInfoResponse,
        s: &mut TrafSend,
        b: &mut dyn ServerHandler,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        let Some(user) = self.kbdint_user.take() else {
            debug!("Unexpected INFO_RESPONSE");
            return Err(Error::SSHProtoError);
        };
        let responses: Vec<String> = p.responses.iter().map(|r| r.to_string_lossy()).collect();
        let reply = b.auth_kbdint_response(&user, &responses).into();
        let methods = b.auth_methods(&user);
        self.reply(reply, &user, methods, s, events)
    }

    fn reply(
        &mut self,
        reply: Reply,
        username: &str,
        methods: AuthMethods,
        s: &mut TrafSend,
        events: &mut VecDeque<Event>,
    ) -> Result<()> {
        let names = LocalNames(methods.names());
        match reply {
            Reply::Sent => Ok(()),
            Reply::Prompts(c) => {
                let prompts = c
                    .prompts
                    .iter()
                    .map(|p| packets::InfoPrompt { prompt: p.prompt.as_str().into(), echo: p.echo })
                    .collect();
                s.send(Userauth60::InfoRequest(packets::UserauthInfoRequest {
                    name: c.name.as_str().into(),
                    instruction: c.instruction.as_str().into(),
                    lang: "",
                    prompts,
                }))?;
                self.kbdint_user = Some(username.into());
                Ok(())
            }
            Reply::Decision(AuthDecision::Accept) => {
                info!("User '{username}' authenticated");
                self.authed = true;
                s.send_userauth_success()?;
                events.push_back(Event::Authenticated { user: username.into() });
                Ok(())
            }
            Reply::Decision(AuthDecision::Partial) => {
                debug!("Partial success for '{username}'");
                s.send(packets::UserauthFailure { methods: (&names).into(), partial: true })
            }
            Reply::Decision(AuthDecision::Deny) => {
                // a none query only asks for the method list
                if !self.none_request {
                    self.attempts += 1;
                }
                if self.attempts >= MAX_AUTH_ATTEMPTS {
                    info!("Too many authentication attempts");
                    s.send(packets::Disconnect {
                        reason: DisconnectReason::SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE as u32,
                        desc: "Too many authentication failures".into(),
                        lang: "".into(),
                    })?;
                    return Err(Error::msg("Too many authentication attempts"));
                }
                s.send(packets::UserauthFailure { methods: (&names).into(), partial: false })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::encrypt::tests::{algo_combos, keyed_pair};
    use crate::encrypt::KeyState;
    use crate::ident::RemoteVersion;
    use crate::packets::{MethodPassword, MethodPubKey, Packet, ParseContext};
    use crate::servauth::*;
    use crate::sign::{KeyPair, SignKey};
    use crate::sshlog::init_test_log;
    use crate::sshwire::{packet_from_bytes, BinString};
    use crate::traffic::{TrafIn, TrafOut};

    struct Serv {
        calls: u32,
    }

    impl ServerHandler for Serv {
        fn auth_banner(&mut self, _user: &str) -> Option<String> {
            Some("welcome".into())
        }

        fn auth_password(&mut self, user: &str, password: &str) -> AuthDecision {
            self.calls += 1;
            if user == "alice" && password == "hunter2" {
                AuthDecision::Accept
            } else {
                AuthDecision::Deny
            }
        }

        fn auth_pubkey_acceptable(&mut self, _user: &str, _algo: &str, pubkey: &[u8]) -> bool {
            pubkey == KeyPair::from_ed25519_seed(&[5; 32]).public_blob()
        }
    }

    struct Wire {
        out: TrafOut,
        ke: KeyState,
        kd: KeyState,
        tin: TrafIn,
        rv: RemoteVersion,
    }

    impl Wire {
        fn new() -> Self {
            let (ke, kd) = keyed_pair(&algo_combos().remove(0));
            let mut rv = RemoteVersion::new(true);
            rv.consume(b"SSH-2.0-x\r\n").unwrap();
            Wire { out: TrafOut::new(), ke, kd, tin: TrafIn::new(), rv }
        }

        fn s(&mut self) -> TrafSend<'_> {
            TrafSend::new(&mut self.out, &mut self.ke)
        }

        /// Message numbers of everything sent
        fn sent(&mut self) -> Vec<u8> {
            let wire = self.out.pending().to_vec();
            self.out.consume(wire.len());
            let mut v = Vec::new();
            let mut w = wire.as_slice();
            while !w.is_empty() {
                let l = self.tin.input(&mut self.kd, &mut self.rv, w).unwrap();
                w = &w[l..];
                if let Some((p, _)) = self.tin.payload() {
                    v.push(p[0]);
                    self.tin.done_payload();
                }
            }
            v
        }
    }

    fn password<'a>(user: &'a str, pw: &'a str) -> UserauthRequest<'a> {
        UserauthRequest {
            username: user.into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::Password(MethodPassword { password: pw.into(), new: None }),
        }
    }

    #[test]
    fn password_and_banner() {
        init_test_log();
        let provider = crate::crypto::default_provider();
        let sess_id = SessId::from_slice(&[1; 32]).unwrap();
        let mut w = Wire::new();
        let mut ev = VecDeque::new();
        let mut b = Serv { calls: 0 };
        let mut a = ServAuth::new();

        a.request(password("alice", "nope"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        // banner before the first failure only
        assert_eq!(w.sent(), [53, 51]);
        a.request(password("alice", "hunter2"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        assert_eq!(w.sent(), [52]);
        assert!(a.authed);
        assert_eq!(ev.pop_front(), Some(Event::Authenticated { user: "alice".into() }));

        // later requests are ignored
        a.request(password("alice", "hunter2"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        assert!(w.sent().is_empty());
        assert_eq!(b.calls, 2);
    }

    #[test]
    fn method_not_offered() {
        init_test_log();
        let provider = crate::crypto::default_provider();
        let sess_id = SessId::from_slice(&[1; 32]).unwrap();
        let mut w = Wire::new();
        let mut ev = VecDeque::new();
        let mut b = Serv { calls: 0 };
        let mut a = ServAuth::new();
        let p = UserauthRequest {
            username: "alice".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::KbdInt(packets::MethodKbdInt { lang: "", submethods: "".into() }),
        };
        a.request(p, &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        assert_eq!(w.sent(), [53, 51]);
        assert!(!a.authed);
    }

    #[test]
    fn pubkey_signed() {
        init_test_log();
        let provider = crate::crypto::default_provider();
        let sess_id = SessId::from_slice(&[9; 32]).unwrap();
        let mut w = Wire::new();
        let mut ev = VecDeque::new();
        let mut b = Serv { calls: 0 };
        let mut a = ServAuth::new();
        let key = KeyPair::from_ed25519_seed(&[5; 32]);
        let blob = key.public_blob();

        // query
        let q = UserauthRequest {
            username: "bob".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: SSH_NAME_ED25519,
                pubkey: BinString(&blob),
                sig: None,
                force_sig: false,
            }),
        };
        a.request(q, &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        let sent = w.sent();
        assert_eq!(sent, [53, 60]);

        // signed with the wrong session id
        let sign = |sid: &SessId| {
            let u = UserauthRequest {
                username: "bob".into(),
                service: SSH_SERVICE_CONNECTION,
                method: AuthMethod::PubKey(MethodPubKey {
                    sig_algo: SSH_NAME_ED25519,
                    pubkey: BinString(&blob),
                    sig: None,
                    force_sig: true,
                }),
            };
            let msg = sshwire::write_ssh_vec(&AuthSigMsg::new(&u, sid)).unwrap();
            key.sign(SSH_NAME_ED25519, &msg).unwrap()
        };
        let req = |sig: &[u8]| -> Vec<u8> {
            let p: Packet = UserauthRequest {
                username: "bob".into(),
                service: SSH_SERVICE_CONNECTION,
                method: AuthMethod::PubKey(MethodPubKey {
                    sig_algo: SSH_NAME_ED25519,
                    pubkey: BinString(&blob),
                    sig: Some(BinString(sig)),
                    force_sig: false,
                }),
            }
            .into();
            sshwire::write_ssh_vec(&p).unwrap()
        };

        let bad = req(&sign(&SessId::from_slice(&[8; 32]).unwrap()));
        let Packet::UserauthRequest(p) = packet_from_bytes(&bad, &ParseContext::default()).unwrap() else {
            panic!()
        };
        a.request(p, &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        assert_eq!(w.sent(), [51]);

        let good = req(&sign(&sess_id));
        let Packet::UserauthRequest(p) = packet_from_bytes(&good, &ParseContext::default()).unwrap() else {
            panic!()
        };
        a.request(p, &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        assert_eq!(w.sent(), [52]);
        assert!(a.authed);
    }

    #[test]
    fn attempts_limited() {
        init_test_log();
        let provider = crate::crypto::default_provider();
        let sess_id = SessId::from_slice(&[1; 32]).unwrap();
        let mut w = Wire::new();
        let mut ev = VecDeque::new();
        let mut b = Serv { calls: 0 };
        let mut a = ServAuth::new();
        for _ in 1..MAX_AUTH_ATTEMPTS {
            a.request(password("eve", "x"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        }
        let r = a.request(password("eve", "x"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev);
        assert!(r.is_err());
        assert_eq!(w.sent().last(), Some(&1));
    }

    #[test]
    fn none_not_an_attempt() {
        init_test_log();
        let provider = crate::crypto::default_provider();
        let sess_id = SessId::from_slice(&[1; 32]).unwrap();
        let mut w = Wire::new();
        let mut ev = VecDeque::new();
        let mut b = Serv { calls: 0 };
        let mut a = ServAuth::new();
        let none = || UserauthRequest {
            username: "eve".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::None,
        };
        a.request(none(), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        for _ in 1..MAX_AUTH_ATTEMPTS {
            a.request(password("eve", "x"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
            a.request(none(), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev).unwrap();
        }
        let sent = w.sent();
        assert!(!sent.contains(&1));
        assert_eq!(sent.iter().filter(|&&m| m == 51).count(), 2 * MAX_AUTH_ATTEMPTS as usize - 1);
        let r = a.request(password("eve", "x"), &sess_id, provider.as_ref(), &mut w.s(), &mut b, &mut ev);
        assert!(r.is_err());
    }
}
