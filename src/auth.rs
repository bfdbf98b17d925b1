//! Types shared by client and server authentication, RFC4252 and RFC4256.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use bitflags::bitflags;

use crate::kex::SessId;
use crate::namelist::NameList;
use crate::packets::{self, MessageNumber};
use crate::sshnames::*;
use crate::sshwire::{BinString, SSHEncode, SSHSink, WireResult};

/// The message to be signed in a pubkey authentication message,
/// RFC4252 Section 7.
///
/// The UserauthRequest's signature field is `None` with `force_sig` set.
#[derive(Debug)]
pub struct AuthSigMsg<'a> {
    pub(crate) sess_id: BinString<'a>,
    pub(crate) u: &'a packets::UserauthRequest<'a>,
}

impl SSHEncode for AuthSigMsg<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.sess_id.enc(s)?;
        (MessageNumber::SSH_MSG_USERAUTH_REQUEST as u8).enc(s)?;
        self.u.enc(s)
    }
}

impl<'a> AuthSigMsg<'a> {
    pub fn new(u: &'a packets::UserauthRequest<'a>, sess_id: &'a SessId) -> Self {
        AuthSigMsg { sess_id: BinString(sess_id.as_slice()), u }
    }
}

/// The method a client has in flight, selects how message 60 is parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthType {
    Password,
    PubKey,
    KbdInt,
}

bitflags! {
    /// A set of authentication methods
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AuthMethods: u32 {
        const NONE = 1 << 0;
        const PASSWORD = 1 << 1;
        const PUBLICKEY = 1 << 2;
        const HOSTBASED = 1 << 3;
        const INTERACTIVE = 1 << 4;
    }
}

const METHOD_NAMES: [(AuthMethods, &str); 5] = [
    (AuthMethods::NONE, SSH_AUTHMETHOD_NONE),
    (AuthMethods::PASSWORD, SSH_AUTHMETHOD_PASSWORD),
    (AuthMethods::PUBLICKEY, SSH_AUTHMETHOD_PUBLICKEY),
    (AuthMethods::HOSTBASED, SSH_AUTHMETHOD_HOSTBASED),
    (AuthMethods::INTERACTIVE, SSH_AUTHMETHOD_INTERACTIVE),
];

impl AuthMethods {
    pub fn from_method_name(name: &str) -> Option<Self> {
        METHOD_NAMES.iter().find(|(_, n)| *n == name).map(|(m, _)| *m)
    }

    /// Unknown names are skipped
    pub fn from_namelist(l: &NameList) -> Self {
        l.iter().filter_map(Self::from_method_name).fold(Self::empty(), |a, m| a | m)
    }

    /// Method names, `none` excluded as it is never advertised
    pub fn names(&self) -> Vec<&'static str> {
        METHOD_NAMES
            .iter()
            .filter(|(m, _)| *m != Self::NONE && self.contains(*m))
            .map(|(_, n)| *n)
            .collect()
    }
}

/// The outcome of a client authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authentication is complete
    Success,
    /// The method or credential was refused. Remaining methods are
    /// in [`Session::auth_methods()`](crate::Session::auth_methods).
    Denied,
    /// The credential was accepted, but another method must also succeed.
    Partial,
    /// The server sent keyboard-interactive prompts, answer them with
    /// [`Session::auth_kbdint_respond()`](crate::Session::auth_kbdint_respond).
    NeedInfo,
    /// The server will accept a signature from this public key.
    KeyAccepted,
}

/// A keyboard-interactive prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbdIntPrompt {
    pub prompt: String,
    /// Whether the response may be displayed as it is typed
    pub echo: bool,
}

/// A round of keyboard-interactive prompts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KbdIntChallenge {
    pub name: String,
    pub instruction: String,
    pub prompts: Vec<KbdIntPrompt>,
}

impl From<&packets::UserauthInfoRequest<'_>> for KbdIntChallenge {
    fn from(r: &packets::UserauthInfoRequest) -> Self {
        Self {
            name: r.name.to_string_lossy(),
            instruction: r.instruction.to_string_lossy(),
            prompts: r
                .prompts
                .iter()
                .map(|p| KbdIntPrompt { prompt: p.prompt.to_string_lossy(), echo: p.echo })
                .collect(),
        }
    }
}

/// A server application's answer to a userauth request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Deny,
    /// Accepted, but more methods are required
    Partial,
}

/// A server application's answer to a keyboard-interactive round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbdIntReply {
    /// Send another round of prompts
    Prompts(KbdIntChallenge),
    Decision(AuthDecision),
}

#[cfg(test)]
mod tests {
    use crate::auth::*;
    use crate::packets::{AuthMethod, MethodPubKey, UserauthRequest};
    use crate::sshlog::init_test_log;
    use crate::sshwire::{write_ssh_vec, BinString};

    #[test]
    fn methods_from_failure() {
        init_test_log();
        let l = NameList::try_from("password,publickey,unknown-method").unwrap();
        let m = AuthMethods::from_namelist(&l);
        assert_eq!(m, AuthMethods::PASSWORD | AuthMethods::PUBLICKEY);
        assert_eq!(m.names(), ["password", "publickey"]);
        assert_eq!(AuthMethods::from_namelist(&NameList::try_from("").unwrap()), AuthMethods::empty());
    }

    #[test]
    fn sig_message_layout() {
        let sess_id = SessId::from_slice(&[0xaa; 32]).unwrap();
        let u = UserauthRequest {
            username: "alice".into(),
            service: SSH_SERVICE_CONNECTION,
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: SSH_NAME_ED25519,
                pubkey: BinString(b"keyblob"),
                sig: None,
                force_sig: true,
            }),
        };
        let v = write_ssh_vec(&AuthSigMsg::new(&u, &sess_id)).unwrap();
        // string session id
        assert_eq!(&v[..4], &[0, 0, 0, 32]);
        assert_eq!(v[36], 50);
        // username follows
        assert_eq!(&v[37..46], b"\0\0\0\x05alice");
        // ends with TRUE, algorithm and key, no signature
        assert!(v.ends_with(b"\x01\0\0\0\x0bssh-ed25519\0\0\0\x07keyblob"));
    }
}
