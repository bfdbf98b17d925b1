//! Limits and per-session configuration.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use crate::crypto::{self, AlgoKind, CryptoProvider};
use crate::sshnames::*;

/// Largest `packet_length` accepted from the wire, also the bound on a
/// decompressed payload.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Initial local window for new channels, and the level it is topped back up to.
pub const DEFAULT_WINDOW: u32 = 128_000;
/// Largest channel data packet we ask the peer to send.
pub const DEFAULT_MAX_PACKET: u32 = 32768;

/// Upper bound on simultaneously allocated channels.
pub const MAX_CHANNELS: usize = 1024;

/// Keyboard-interactive prompt limit for a single INFO_REQUEST or INFO_RESPONSE.
pub const KBDINT_MAX_PROMPTS: usize = 256;

/// A server disconnects after this many failed userauth requests.
pub const MAX_AUTH_ATTEMPTS: u32 = 20;

/// The identification line, including the trailing CR LF.
pub const MAX_BANNER_LINE: usize = 127;
/// Other lines a server may send before its identification line (RFC4253 4.2).
pub const MAX_PRE_BANNER_LINE: usize = 255;
pub const MAX_PRE_BANNER_LINES: usize = 50;

pub const MAX_USERNAME: usize = 256;

// Enough for longest 23 of "screen.konsole-256color" on my system
// Unsure if this is specified somewhere
pub const MAX_TERM: usize = 32;

pub const DEFAULT_TERM: &str = "xterm";

pub const RSA_DEFAULT_KEYSIZE: usize = 2048;
pub const RSA_MIN_KEYSIZE: usize = 1024;

/// Re-key after this much traffic in either direction.
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

pub const DEFAULT_SOFTWARE_VERSION: &str =
    concat!("sunset_libssh_", env!("CARGO_PKG_VERSION"));

/// Configuration for a [`Session`](crate::Session).
///
/// Algorithm lists are in preference order. Names the crypto provider
/// doesn't support are skipped when the session is created.
#[derive(Clone)]
pub struct SshConfig {
    /// Software version in our identification line, `SSH-2.0-<version>`.
    pub version: String,
    pub kex: Vec<&'static str>,
    pub hostkey: Vec<&'static str>,
    pub ciphers: Vec<&'static str>,
    pub macs: Vec<&'static str>,
    pub compression: Vec<&'static str>,
    /// Initial window for channels we open or accept
    pub window: u32,
    /// Max packet for channels we open or accept
    pub max_packet: u32,
    /// Traffic in one direction after which a key exchange is started.
    pub rekey_bytes: u64,
    pub provider: Arc<dyn CryptoProvider>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_SOFTWARE_VERSION.into(),
            kex: vec![
                SSH_NAME_CURVE25519,
                SSH_NAME_CURVE25519_LIBSSH,
                SSH_NAME_DH_GROUP14_SHA256,
                SSH_NAME_DH_GROUP14_SHA1,
            ],
            hostkey: vec![SSH_NAME_ED25519, SSH_NAME_RSA_SHA256, SSH_NAME_RSA],
            ciphers: vec![
                SSH_NAME_CHAPOLY,
                SSH_NAME_AES256_CTR,
                SSH_NAME_AES192_CTR,
                SSH_NAME_AES128_CTR,
            ],
            macs: vec![
                SSH_NAME_HMAC_SHA256,
                SSH_NAME_HMAC_SHA512,
                SSH_NAME_HMAC_SHA1,
            ],
            compression: vec![
                SSH_NAME_NONE,
                SSH_NAME_ZLIB_OPENSSH,
                SSH_NAME_ZLIB,
            ],
            window: DEFAULT_WINDOW,
            max_packet: DEFAULT_MAX_PACKET,
            rekey_bytes: DEFAULT_REKEY_BYTES,
            provider: crypto::default_provider(),
        }
    }
}

impl core::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SshConfig")
            .field("version", &self.version)
            .field("kex", &self.kex)
            .field("hostkey", &self.hostkey)
            .field("ciphers", &self.ciphers)
            .field("macs", &self.macs)
            .field("compression", &self.compression)
            .field("window", &self.window)
            .field("max_packet", &self.max_packet)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl SshConfig {
    /// Checks limits and drops algorithm names the provider can't supply.
    pub(crate) fn validate(&mut self) -> Result<()> {
        let banner_len = "SSH-2.0-".len() + self.version.len() + 2;
        if banner_len > MAX_BANNER_LINE {
            return Err(Error::BadUsage { msg: "version string too long" });
        }
        if self.version.bytes().any(|c| c.is_ascii_whitespace() || c == b'-' || !c.is_ascii_graphic()) {
            return Err(Error::BadUsage { msg: "invalid version string" });
        }
        if self.window == 0 || self.max_packet == 0 {
            return Err(Error::BadUsage { msg: "zero window or max packet" });
        }
        let provider = self.provider.clone();
        for (kind, list) in [
            (AlgoKind::Kex, &mut self.kex),
            (AlgoKind::HostKey, &mut self.hostkey),
            (AlgoKind::Cipher, &mut self.ciphers),
            (AlgoKind::Mac, &mut self.macs),
        ] {
            list.retain(|n| {
                let ok = provider.supports(kind, n);
                if !ok {
                    debug!("Provider {} lacks {kind:?} {n}", provider.name());
                }
                ok
            });
            if list.is_empty() {
                return Err(Error::AlgoNoMatch { algo: kind.name() });
            }
        }
        self.compression.retain(|n| crate::compress::supported(n));
        if self.compression.is_empty() {
            return Err(Error::AlgoNoMatch { algo: AlgoKind::Compression.name() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn default_validates() {
        init_test_log();
        let mut c = SshConfig::default();
        c.validate().unwrap();
        assert_eq!(c.kex[0], SSH_NAME_CURVE25519);
        assert!(c.compression.contains(&SSH_NAME_NONE));
    }

    #[test]
    fn unknown_names_dropped() {
        let mut c = SshConfig::default();
        c.ciphers = vec!["3des-cbc", SSH_NAME_AES128_CTR];
        c.validate().unwrap();
        assert_eq!(c.ciphers, vec![SSH_NAME_AES128_CTR]);

        c.macs = vec!["hmac-md5"];
        assert!(matches!(c.validate(), Err(Error::AlgoNoMatch { .. })));
    }

    #[test]
    fn bad_version() {
        let mut c = SshConfig::default();
        c.version = "has space".into();
        assert!(c.validate().is_err());
        c.version = "x".repeat(200);
        assert!(c.validate().is_err());
        // '-' separates the protocol and software versions
        c.version = "a-b".into();
        assert!(c.validate().is_err());
        assert!(!DEFAULT_SOFTWARE_VERSION.contains('-'));
    }
}
