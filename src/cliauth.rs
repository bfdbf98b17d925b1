//! Client side user authentication, RFC4252 and RFC4256.
//!
//! Requests are started by the application and complete when the server
//! replies, the outcome is collected with [`CliAuth::take_result()`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use zeroize::Zeroizing;

use crate::auth::{AuthMethods, AuthResult, AuthSigMsg, AuthType, KbdIntChallenge};
use crate::config::MAX_USERNAME;
use crate::kex::SessId;
use crate::packets::{self, AuthMethod, MethodPubKey, ParseContext, Userauth60, UserauthRequest};
use crate::sign::SignKey;
use crate::sshnames::*;
use crate::sshwire::{self, BinString, TextString};
use crate::traffic::TrafSend;

#[derive(Debug)]
enum AuthState {
    Idle,
    /// Awaiting the reply to none, password or a signed publickey request
    Request,
    /// A publickey query without signature, awaiting PK_OK
    PubKeyQuery { blob: Vec<u8> },
    /// A keyboard-interactive exchange is under way
    KbdInt,
}

pub(crate) struct CliAuth {
    service_requested: bool,
    service_accepted: bool,

    state: AuthState,
    result: Option<AuthResult>,

    /// Methods from the server's last failure. Empty until the first failure.
    methods: AuthMethods,
    banner: Option<String>,

    challenge: Option<KbdIntChallenge>,
    answers: Vec<Zeroizing<String>>,

    username: String,
    authenticated: bool,
}

impl CliAuth {
    pub fn new() -> Self {
        CliAuth {
            service_requested: false,
            service_accepted: false,
            state: AuthState::Idle,
            result: None,
            methods: AuthMethods::empty(),
            banner: None,
            challenge: None,
            answers: Vec::new(),
            username: String::new(),
            authenticated: false,
        }
    }

    /// A request has been sent and no reply has arrived
    pub fn in_progress(&self) -> bool {
        self.result.is_none() && !matches!(self.state, AuthState::Idle)
    }

    pub fn take_result(&mut self) -> Option<AuthResult> {
        self.result.take()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn methods(&self) -> AuthMethods {
        self.methods
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn challenge(&self) -> Option<&KbdIntChallenge> {
        self.challenge.as_ref()
    }

    /// Checks a request can be sent and sends the service request first.
    fn start(&mut self, username: &str, s: &mut TrafSend) -> Result<()> {
        if self.authenticated {
            return Err(Error::BadUsage { msg: "already authenticated" });
        }
        if self.in_progress() {
            return Err(Error::BadUsage { msg: "authentication in progress" });
        }
        if username.len() > MAX_USERNAME {
            return Err(Error::BadUsage { msg: "username too long" });
        }
        if !self.service_requested {
            s.send(packets::ServiceRequest { name: SSH_SERVICE_USERAUTH })?;
            self.service_requested = true;
        }
        self.result = None;
        self.challenge = None;
        self.answers.clear();
        self.username = username.into();
        Ok(())
    }

    fn send_request(
        &mut self,
        method: AuthMethod,
        auth_type: Option<AuthType>,
        state: AuthState,
        ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        trace!("Sending userauth {:?}", method);
        s.send(UserauthRequest {
            username: self.username.as_str().into(),
            service: SSH_SERVICE_CONNECTION,
            method,
        })?;
        ctx.cli_auth_type = auth_type;
        self.state = state;
        Ok(())
    }

    pub fn request_none(
        &mut self,
        username: &str,
        ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.start(username, s)?;
        self.send_request(AuthMethod::None, None, AuthState::Request, ctx, s)
    }

    pub fn request_password(
        &mut self,
        username: &str,
        password: &str,
        ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.start(username, s)?;
        let m = AuthMethod::Password(packets::MethodPassword {
            password: password.into(),
            new: None,
        });
        self.send_request(m, Some(AuthType::Password), AuthState::Request, ctx, s)
    }

    /// Asks whether the server would accept a key, without signing.
    pub fn request_pubkey_query(
        &mut self,
        username: &str,
        key: &dyn SignKey,
        ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.start(username, s)?;
        let blob = key.public_blob();
        let sig_algo = sig_algo(key)?;
        let m = AuthMethod::PubKey(MethodPubKey {
            sig_algo,
            pubkey: BinString(&blob),
            sig: None,
            force_sig: false,
        });
        let state = AuthState::PubKeyQuery { blob: blob.clone() };
        self.send_request(m, Some(AuthType::PubKey), state, ctx, s)
    }

    /// Sends a signed publickey request.
    pub fn request_pubkey_sign(
        &mut self,
        username: &str,
        key: &dyn SignKey,
        sess_id: &SessId,
        ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.start(username, s)?;
        let blob = key.public_blob();
        let sig_algo = sig_algo(key)?;

        // Sign the request without the signature
        let u = UserauthRequest {
            username: self.username.as_str().into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo,
                pubkey: BinString(&blob),
                sig: None,
                force_sig: true,
            }),
        };
        let msg = sshwire::write_ssh_vec(&AuthSigMsg::new(&u, sess_id))?;
        let sig = key.sign(sig_algo, &msg)?;

        let m = AuthMethod::PubKey(MethodPubKey {
            sig_algo,
            pubkey: BinString(&blob),
            sig: Some(BinString(&sig)),
            force_sig: false,
        });
        self.send_request(m, Some(AuthType::PubKey), AuthState::Request, ctx, s)
    }

    pub fn request_kbdint(
        &mut self,
        username: &str,
        submethods: &str,
        ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.start(username, s)?;
        let m = AuthMethod::KbdInt(packets::MethodKbdInt {
            lang: "",
            submethods: submethods.into(),
        });
        self.send_request(m, Some(AuthType::KbdInt), AuthState::KbdInt, ctx, s)
    }

    pub fn set_answer(&mut self, index: usize, answer: &str) -> Result<()> {
        let Some(c) = &self.challenge else {
            return Err(Error::BadUsage { msg: "no keyboard-interactive prompts" });
        };
        if index >= c.prompts.len() {
            return Err(Error::BadUsage { msg: "prompt index out of range" });
        }
        if self.answers.len() <= index {
            self.answers.resize_with(index + 1, Default::default);
        }
        self.answers[index] = Zeroizing::new(answer.into());
        Ok(())
    }

    /// Sends the answers set for the current prompts. Prompts without
    /// an answer get an empty response.
    pub fn respond(&mut self, s: &mut TrafSend) -> Result<()> {
        let Some(c) = self.challenge.take() else {
            return Err(Error::BadUsage { msg: "no keyboard-interactive prompts" });
        };
        self.answers.resize_with(c.prompts.len(), Default::default);
        let responses = self.answers.iter().map(|a| TextString(a.as_bytes())).collect();
        s.send(packets::UserauthInfoResponse { responses })?;
        self.answers.clear();
        self.result = None;
        self.state = AuthState::KbdInt;
        Ok(())
    }

    pub fn service_accept(&mut self, p: &packets::ServiceAccept) -> Result<()> {
        if !self.service_requested || self.service_accepted || p.name != SSH_SERVICE_USERAUTH {
            debug!("Unexpected service accept '{}'", p.name);
            return Err(Error::SSHProtoError);
        }
        self.service_accepted = true;
        Ok(())
    }

    pub fn set_banner(&mut self, p: &packets::UserauthBanner) -> String {
        let m = p.message.to_string_lossy();
        self.banner = Some(m.clone());
        m
    }

    fn finish(&mut self, result: AuthResult, ctx: &mut ParseContext) {
        debug!("Userauth result {result:?}");
        ctx.cli_auth_type = None;
        self.state = AuthState::Idle;
        self.result = Some(result);
    }

    pub fn failure(&mut self, p: &packets::UserauthFailure, ctx: &mut ParseContext) -> Result<()> {
        if matches!(self.state, AuthState::Idle) {
            debug!("Userauth failure without a request");
            return Err(Error::SSHProtoError);
        }
        self.methods = AuthMethods::from_namelist(&p.methods);
        trace!("Server allows {:?}", self.methods);
        self.challenge = None;
        let r = if p.partial { AuthResult::Partial } else { AuthResult::Denied };
        self.finish(r, ctx);
        Ok(())
    }

    /// Returns the authenticated username
    pub fn success(&mut self, ctx: &mut ParseContext, s: &mut TrafSend) -> Result<String> {
        if matches!(self.state, AuthState::Idle) || self.authenticated {
            debug!("Userauth success without a request");
            return Err(Error::SSHProtoError);
        }
        self.authenticated = true;
        self.challenge = None;
        s.enable_delayed_compression();
        self.finish(AuthResult::Success, ctx);
        Ok(self.username.clone())
    }

    pub fn auth60(&mut self, p: &Userauth60, ctx: &mut ParseContext) -> Result<()> {
        match (p, &self.state) {
            (Userauth60::PkOk(ok), AuthState::PubKeyQuery { blob }) => {
                if ok.key.0 != blob.as_slice() {
                    debug!("PK_OK for a different key");
                    return Err(Error::SSHProtoError);
                }
                self.finish(AuthResult::KeyAccepted, ctx);
            }
            (Userauth60::PwChangeReq(req), AuthState::Request) => {
                // Password changes aren't supported
                info!("Server requests a password change: {}", req.prompt.to_string_lossy());
                self.finish(AuthResult::Denied, ctx);
            }
            (Userauth60::InfoRequest(req), AuthState::KbdInt) => {
                let c = KbdIntChallenge::from(req);
                debug!("Keyboard-interactive prompts, {}", c.prompts.len());
                self.answers.clear();
                self.challenge = Some(c);
                // remains in KbdInt, the next message is also an INFO_REQUEST or result
                self.result = Some(AuthResult::NeedInfo);
            }
            _ => {
                debug!("Unexpected userauth 60 in state {:?}", self.state);
                return Err(Error::SSHProtoError);
            }
        }
        Ok(())
    }
}

fn sig_algo(key: &dyn SignKey) -> Result<&'static str> {
    key.sig_algorithms().first().copied().ok_or(Error::BadKey)
}

#[cfg(test)]
mod tests {
    use crate::auth::*;
    use crate::cliauth::*;
    use crate::namelist::NameList;
    use crate::packets::{InfoPrompt, UserauthBanner, UserauthFailure, UserauthInfoRequest, UserauthPkOk};
    use crate::sign::KeyPair;
    use crate::sshlog::init_test_log;
    use crate::traffic::TrafOut;
    use crate::encrypt::tests::{algo_combos, keyed_pair};

    struct Out {
        out: TrafOut,
        ke: crate::encrypt::KeyState,
    }

    impl Out {
        fn new() -> Self {
            let (ke, _) = keyed_pair(&algo_combos().remove(0));
            Out { out: TrafOut::new(), ke }
        }

        fn s(&mut self) -> TrafSend<'_> {
            TrafSend::new(&mut self.out, &mut self.ke)
        }
    }

    fn failure(methods: &str, partial: bool) -> UserauthFailure<'_> {
        UserauthFailure { methods: NameList::try_from(methods).unwrap(), partial }
    }

    #[test]
    fn failure_updates_methods() {
        init_test_log();
        let mut out = Out::new();
        let mut ctx = ParseContext::default();
        let mut a = CliAuth::new();
        a.request_none("alice", &mut ctx, &mut out.s()).unwrap();
        assert!(a.in_progress());
        // only one request at a time
        assert!(a.request_none("alice", &mut ctx, &mut out.s()).is_err());

        a.failure(&failure("password,publickey", false), &mut ctx).unwrap();
        assert_eq!(a.take_result(), Some(AuthResult::Denied));
        assert_eq!(a.methods(), AuthMethods::PASSWORD | AuthMethods::PUBLICKEY);

        a.request_password("alice", "wrong", &mut ctx, &mut out.s()).unwrap();
        assert_eq!(ctx.cli_auth_type, Some(AuthType::Password));
        a.failure(&failure("publickey", true), &mut ctx).unwrap();
        assert_eq!(a.take_result(), Some(AuthResult::Partial));
        assert_eq!(a.methods(), AuthMethods::PUBLICKEY);
        assert_eq!(ctx.cli_auth_type, None);

        // unsolicited
        assert!(a.failure(&failure("password", false), &mut ctx).is_err());
    }

    #[test]
    fn latest_banner_kept() {
        init_test_log();
        let mut a = CliAuth::new();
        assert_eq!(a.banner(), None);
        let m = a.set_banner(&UserauthBanner { message: "first".into(), lang: "".into() });
        assert_eq!(m, "first");
        a.set_banner(&UserauthBanner { message: "second".into(), lang: "".into() });
        assert_eq!(a.banner(), Some("second"));
    }

    #[test]
    fn pubkey_query() {
        init_test_log();
        let mut out = Out::new();
        let mut ctx = ParseContext::default();
        let mut a = CliAuth::new();
        let key = KeyPair::from_ed25519_seed(&[3; 32]);
        let other = KeyPair::from_ed25519_seed(&[4; 32]);

        a.request_pubkey_query("bob", &key, &mut ctx, &mut out.s()).unwrap();
        let blob = other.public_blob();
        let wrong = Userauth60::PkOk(UserauthPkOk { algo: SSH_NAME_ED25519, key: BinString(&blob) });
        assert!(a.auth60(&wrong, &mut ctx).is_err());

        let blob = key.public_blob();
        let ok = Userauth60::PkOk(UserauthPkOk { algo: SSH_NAME_ED25519, key: BinString(&blob) });
        a.auth60(&ok, &mut ctx).unwrap();
        assert_eq!(a.take_result(), Some(AuthResult::KeyAccepted));
        assert!(!a.in_progress());
    }

    #[test]
    fn kbdint_rounds() {
        init_test_log();
        let mut out = Out::new();
        let mut ctx = ParseContext::default();
        let mut a = CliAuth::new();
        a.request_kbdint("carol", "", &mut ctx, &mut out.s()).unwrap();
        assert_eq!(ctx.cli_auth_type, Some(AuthType::KbdInt));

        let req = UserauthInfoRequest {
            name: "login".into(),
            instruction: "".into(),
            lang: "",
            prompts: vec![
                InfoPrompt { prompt: "Password: ".into(), echo: false },
                InfoPrompt { prompt: "Code: ".into(), echo: true },
            ],
        };
        a.auth60(&Userauth60::InfoRequest(req), &mut ctx).unwrap();
        assert_eq!(a.take_result(), Some(AuthResult::NeedInfo));
        let c = a.challenge().unwrap();
        assert_eq!(c.prompts.len(), 2);
        assert!(c.prompts[1].echo);

        a.set_answer(0, "pw").unwrap();
        assert!(a.set_answer(2, "x").is_err());
        // the second answer is sent empty
        a.respond(&mut out.s()).unwrap();
        assert!(a.in_progress());
        assert!(a.respond(&mut out.s()).is_err());

        assert_eq!(a.success(&mut ctx, &mut out.s()).unwrap(), "carol");
        assert_eq!(a.take_result(), Some(AuthResult::Success));
        assert!(a.is_authenticated());
        assert!(a.request_none("carol", &mut ctx, &mut out.s()).is_err());
    }
}
