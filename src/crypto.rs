//! Pluggable cryptographic primitives.
//!
//! The protocol engine never calls a cipher, MAC, hash or key agreement
//! directly. Everything goes through a [`CryptoProvider`], by default
//! [`RustCryptoProvider`](crate::rustcrypto::RustCryptoProvider).

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use zeroize::Zeroizing;

/// The category of a negotiated algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgoKind {
    Kex,
    /// Host key signature algorithms
    HostKey,
    Cipher,
    Mac,
    Compression,
}

impl AlgoKind {
    pub fn name(&self) -> &'static str {
        match self {
            AlgoKind::Kex => "kex",
            AlgoKind::HostKey => "hostkey",
            AlgoKind::Cipher => "cipher",
            AlgoKind::Mac => "mac",
            AlgoKind::Compression => "compression",
        }
    }
}

/// Hash used by a key exchange method, for the exchange hash and key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlg {
    pub fn output_len(&self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha512 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherInfo {
    pub key_len: usize,
    pub iv_len: usize,
    /// Packets are padded to a multiple of this
    pub block_size: usize,
    /// Authenticated encryption, no separate MAC is negotiated
    pub aead: bool,
    /// Tag length for AEAD ciphers
    pub tag_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacInfo {
    pub key_len: usize,
    pub mac_len: usize,
}

/// A stream or block cipher mode, keeping its state between packets.
pub trait SshCipher: Send {
    /// Encrypts or decrypts in place. `buf` is a multiple of the block size.
    fn apply(&mut self, buf: &mut [u8]);
}

/// An authenticated cipher where the packet length is itself encrypted.
pub trait SshAead: Send {
    fn tag_len(&self) -> usize;

    /// Decrypts the packet length from the first 4 bytes of `buf`.
    fn open_length(&self, seq: u32, buf: &[u8]) -> Result<u32>;

    /// Checks the tag then decrypts in place. `packet` includes the
    /// still-encrypted length field.
    fn open(&self, seq: u32, packet: &mut [u8], tag: &[u8]) -> Result<()>;

    /// Encrypts in place including the length field, writing the tag.
    fn seal(&self, seq: u32, packet: &mut [u8], tag: &mut [u8]) -> Result<()>;
}

/// A message authentication code over `seq || packet`
pub trait SshMac: Send {
    fn mac_len(&self) -> usize;

    /// `out` is `mac_len()` long
    fn sign(&self, seq: u32, data: &[u8], out: &mut [u8]);

    /// Returns [`Error::BadDecrypt`] on mismatch. Must be constant time.
    fn verify(&self, seq: u32, data: &[u8], tag: &[u8]) -> Result<()>;
}

/// One side of an ephemeral key agreement.
pub trait SshKex: Send {
    fn name(&self) -> &'static str;

    fn hash_alg(&self) -> HashAlg;

    /// Our public value as sent on the wire. For finite field
    /// Diffie-Hellman this is the mpint body of `e` or `f`.
    fn public(&self) -> &[u8];

    /// Computes the shared secret `K` as big-endian unsigned bytes.
    ///
    /// Fails if the peer's value is out of range or gives a degenerate result.
    fn agree(self: Box<Self>, peer: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// A constructed cipher
pub enum CipherInstance {
    Stream(Box<dyn SshCipher>),
    Aead(Box<dyn SshAead>),
}

impl core::fmt::Debug for CipherInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CipherInstance::Stream(_) => f.write_str("Stream"),
            CipherInstance::Aead(_) => f.write_str("Aead"),
        }
    }
}

/// Supplies every cryptographic primitive used by a session.
///
/// A provider is shared between sessions, so implementations hold no
/// per-session state.
pub trait CryptoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Supported algorithm names of a kind, in default preference order.
    fn algorithms(&self, kind: AlgoKind) -> &[&'static str];

    fn supports(&self, kind: AlgoKind, name: &str) -> bool {
        self.algorithms(kind).iter().any(|a| *a == name)
    }

    fn cipher_info(&self, name: &str) -> Result<CipherInfo>;

    fn new_cipher(&self, name: &str, key: &[u8], iv: &[u8], encrypt: bool)
        -> Result<CipherInstance>;

    fn mac_info(&self, name: &str) -> Result<MacInfo>;

    fn new_mac(&self, name: &str, key: &[u8]) -> Result<Box<dyn SshMac>>;

    /// Starts a key agreement, generating an ephemeral key.
    fn new_kex(&self, name: &str) -> Result<Box<dyn SshKex>>;

    fn hasher(&self, alg: HashAlg) -> Box<dyn digest::DynDigest + Send>;

    /// Verifies `sig_blob` (`string algorithm || string signature`) over `msg`
    /// with a public key blob.
    ///
    /// `algo` is the expected signature algorithm, which must match the blob.
    fn verify(&self, algo: &str, pubkey_blob: &[u8], msg: &[u8], sig_blob: &[u8])
        -> Result<()>;

    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;
}

/// Returns the built in provider
pub fn default_provider() -> Arc<dyn CryptoProvider> {
    Arc::new(crate::rustcrypto::RustCryptoProvider::new())
}

/// Computes a hash over several parts
pub(crate) fn hash_parts(p: &dyn CryptoProvider, alg: HashAlg, parts: &[&[u8]]) -> Vec<u8> {
    let mut h = p.hasher(alg);
    for part in parts {
        h.update(part);
    }
    h.finalize().into_vec()
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::crypto::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn hash_lengths() {
        init_test_log();
        let p = default_provider();
        for alg in [HashAlg::Sha1, HashAlg::Sha256, HashAlg::Sha512] {
            let h = hash_parts(p.as_ref(), alg, &[b"abc", b"def"]);
            assert_eq!(h.len(), alg.output_len());
            let h2 = hash_parts(p.as_ref(), alg, &[b"abcdef"]);
            assert_eq!(h, h2);
        }
    }

    #[test]
    fn every_listed_algorithm_constructs() {
        let p = default_provider();
        for name in p.algorithms(AlgoKind::Cipher) {
            let info = p.cipher_info(name).unwrap();
            let key = vec![3u8; info.key_len];
            let iv = vec![4u8; info.iv_len];
            p.new_cipher(name, &key, &iv, true).unwrap();
        }
        for name in p.algorithms(AlgoKind::Mac) {
            let info = p.mac_info(name).unwrap();
            let m = p.new_mac(name, &vec![5u8; info.key_len]).unwrap();
            assert_eq!(m.mac_len(), info.mac_len);
        }
        for name in p.algorithms(AlgoKind::Kex) {
            let k = p.new_kex(name).unwrap();
            assert_eq!(k.name(), *name);
        }
        assert!(p.cipher_info("rot13").is_err());
    }
}
