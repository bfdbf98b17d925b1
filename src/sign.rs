#[allow(unused_imports)]
use {
    crate::error::*,
    log::{debug, error, info, log, trace, warn},
};

use rand_core::OsRng;
use signature::{SignatureEncoding, Signer, Verifier};

use crate::config::RSA_MIN_KEYSIZE;
use crate::sshnames::*;
use crate::sshwire::{self, BinString, Mpint};
use crate::sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireError, WireResult};

/// A parsed public key blob, RFC4253 section 6.6
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubKey {
    Ed25519([u8; 32]),
    /// Big-endian exponent and modulus
    Rsa { e: Vec<u8>, n: Vec<u8> },
}

impl PubKey {
    /// The key type name
    pub fn algorithm(&self) -> &'static str {
        match self {
            PubKey::Ed25519(_) => SSH_NAME_ED25519,
            PubKey::Rsa { .. } => SSH_NAME_RSA,
        }
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let ty: &str = sshwire::read_ssh(blob, None)?;
        if !matches!(ty, SSH_NAME_ED25519 | SSH_NAME_RSA) {
            debug!("Unknown key type \"{}\"", ty.escape_default());
            return Err(Error::UnknownMethod { kind: "key" });
        }
        sshwire::read_ssh(blob, None)
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        sshwire::write_ssh_vec(self)
    }

    /// Whether a signature algorithm can be made with this key type
    pub fn allows_sig(&self, sig_algo: &str) -> bool {
        match self {
            PubKey::Ed25519(_) => sig_algo == SSH_NAME_ED25519,
            PubKey::Rsa { .. } => matches!(sig_algo, SSH_NAME_RSA_SHA256 | SSH_NAME_RSA),
        }
    }

    #[cfg(feature = "openssh-key")]
    pub fn matches_openssh(&self, k: &str) -> Result<bool> {
        let k = ssh_key::PublicKey::from_openssh(k)
            .map_err(|_| Error::msg("Unsupported OpenSSH key"))?;

        let m = match (k.key_data(), self) {
            (ssh_key::public::KeyData::Ed25519(kssh), PubKey::Ed25519(kself)) => {
                kssh.0 == *kself
            }
            _ => false,
        };
        Ok(m)
    }
}

impl SSHEncode for PubKey {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.algorithm().enc(s)?;
        match self {
            PubKey::Ed25519(k) => BinString(k).enc(s),
            PubKey::Rsa { e, n } => {
                Mpint(e).enc(s)?;
                Mpint(n).enc(s)
            }
        }
    }
}

impl<'de> SSHDecode<'de> for PubKey {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let ty: &str = SSHDecode::dec(s)?;
        match ty {
            SSH_NAME_ED25519 => {
                let k = BinString::dec(s)?;
                let k = k.0.try_into().map_err(|_| WireError::SSHProtoError)?;
                Ok(PubKey::Ed25519(k))
            }
            SSH_NAME_RSA => {
                let e = Mpint::dec(s)?.0.to_vec();
                let n = Mpint::dec(s)?.0.to_vec();
                Ok(PubKey::Rsa { e, n })
            }
            _ => Err(WireError::SSHProtoError),
        }
    }
}

/// `string algorithm || string signature`
struct SigBlob<'a> {
    algo: &'a str,
    sig: BinString<'a>,
}

impl SSHEncode for SigBlob<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.algo.enc(s)?;
        self.sig.enc(s)
    }
}

impl<'a> SSHDecode<'a> for SigBlob<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        Ok(Self { algo: SSHDecode::dec(s)?, sig: SSHDecode::dec(s)? })
    }
}

/// Splits a signature blob into the algorithm name and raw signature
pub fn split_sig_blob(blob: &[u8]) -> Result<(&str, &[u8])> {
    let b: SigBlob = sshwire::read_ssh(blob, None).map_err(|_| Error::BadSig)?;
    Ok((b.algo, b.sig.0))
}

fn make_sig_blob(algo: &str, sig: &[u8]) -> Result<Vec<u8>> {
    sshwire::write_ssh_vec(&SigBlob { algo, sig: BinString(sig) })
}

/// A SSH signing key. This may hold the private part locally
/// or could send the signing requests to a SSH agent or other entity.
///
/// Used for server host keys and client public key authentication.
pub trait SignKey: Send + Sync {
    /// The key type name, such as `ssh-rsa`
    fn algorithm(&self) -> &'static str;

    /// Signature algorithms the key can make, in preference order
    fn sig_algorithms(&self) -> &[&'static str];

    fn public_blob(&self) -> Vec<u8>;

    /// Returns a signature blob
    fn sign(&self, sig_algo: &str, msg: &[u8]) -> Result<Vec<u8>>;
}

/// A local private key
pub enum KeyPair {
    Ed25519(ed25519_dalek::SigningKey),
    Rsa(Box<rsa::RsaPrivateKey>),
}

impl KeyPair {
    pub fn generate_ed25519() -> Result<Self> {
        Ok(Self::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng)))
    }

    pub fn from_ed25519_seed(seed: &[u8; 32]) -> Self {
        Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed))
    }

    /// Generates a new RSA key. Slow.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        if bits < RSA_MIN_KEYSIZE {
            return Err(Error::BadUsage { msg: "RSA key too small" });
        }
        let k = rsa::RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| {
            debug!("RSA generation failed: {e}");
            Error::msg("RSA generation failed")
        })?;
        Ok(Self::Rsa(Box::new(k)))
    }

    #[cfg(feature = "openssh-key")]
    pub fn from_openssh(k: impl AsRef<[u8]>) -> Result<Self> {
        let k = ssh_key::PrivateKey::from_openssh(k)
            .map_err(|_| Error::msg("Unsupported OpenSSH key"))?;

        match k.key_data() {
            ssh_key::private::KeypairData::Ed25519(k) => {
                Ok(Self::from_ed25519_seed(&k.private.to_bytes()))
            }
            _ => Err(Error::NotAvailable { what: "OpenSSH key type" }),
        }
    }

    pub fn pubkey(&self) -> PubKey {
        match self {
            KeyPair::Ed25519(k) => PubKey::Ed25519(k.verifying_key().to_bytes()),
            KeyPair::Rsa(k) => {
                use rsa::traits::PublicKeyParts;
                PubKey::Rsa { e: k.e().to_bytes_be(), n: k.n().to_bytes_be() }
            }
        }
    }
}

impl SignKey for KeyPair {
    fn algorithm(&self) -> &'static str {
        self.pubkey().algorithm()
    }

    fn sig_algorithms(&self) -> &[&'static str] {
        match self {
            KeyPair::Ed25519(_) => &[SSH_NAME_ED25519],
            KeyPair::Rsa(_) => &[SSH_NAME_RSA_SHA256, SSH_NAME_RSA],
        }
    }

    fn public_blob(&self) -> Vec<u8> {
        // Only fixed size parts, can't fail
        self.pubkey().to_blob().unwrap_or_default()
    }

    fn sign(&self, sig_algo: &str, msg: &[u8]) -> Result<Vec<u8>> {
        let sig = match (self, sig_algo) {
            (KeyPair::Ed25519(k), SSH_NAME_ED25519) => {
                let sig = k.sign(msg);
                // Faults in signing can expose the private key. We verify the signature
                // just created to avoid this problem.
                k.verifying_key().verify(msg, &sig).trap()?;
                sig.to_bytes().to_vec()
            }
            (KeyPair::Rsa(k), SSH_NAME_RSA_SHA256) => {
                let sk = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new((**k).clone());
                sk.sign(msg).to_bytes().into_vec()
            }
            (KeyPair::Rsa(k), SSH_NAME_RSA) => {
                let sk = rsa::pkcs1v15::SigningKey::<sha1::Sha1>::new((**k).clone());
                sk.sign(msg).to_bytes().into_vec()
            }
            _ => {
                warn!("Can't sign {sig_algo} with a {} key", self.algorithm());
                return Err(Error::BadUsage { msg: "signature type doesn't match key" });
            }
        };
        make_sig_blob(sig_algo, &sig)
    }
}

impl core::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            KeyPair::Ed25519(_) => "Ed25519",
            KeyPair::Rsa(_) => "Rsa",
        };
        f.debug_struct("KeyPair").field(s, &"...").finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::sign::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn ed25519_blob() {
        init_test_log();
        let k = KeyPair::from_ed25519_seed(&[7u8; 32]);
        let blob = k.public_blob();
        // string "ssh-ed25519", string key
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(PubKey::from_blob(&blob).unwrap(), k.pubkey());
    }

    #[test]
    fn rsa_blob() {
        let k = KeyPair::generate_rsa(1024).unwrap();
        let blob = k.public_blob();
        let p = PubKey::from_blob(&blob).unwrap();
        assert_eq!(p.algorithm(), SSH_NAME_RSA);
        assert!(p.allows_sig(SSH_NAME_RSA_SHA256));
        assert!(!p.allows_sig(SSH_NAME_ED25519));
    }

    #[test]
    fn unknown_key_type() {
        let blob = sshwire::write_ssh_vec(&"ecdsa-sha2-nistp256").unwrap();
        assert!(matches!(
            PubKey::from_blob(&blob),
            Err(Error::UnknownMethod { .. })
        ));
    }

    #[test]
    fn sig_blob_layout() {
        let k = KeyPair::from_ed25519_seed(&[1u8; 32]);
        let sig = k.sign(SSH_NAME_ED25519, b"msg").unwrap();
        let (algo, raw) = split_sig_blob(&sig).unwrap();
        assert_eq!(algo, SSH_NAME_ED25519);
        assert_eq!(raw.len(), 64);
        assert!(k.sign(SSH_NAME_RSA, b"msg").is_err());
    }

    #[test]
    fn small_rsa_refused() {
        assert!(KeyPair::generate_rsa(512).is_err());
    }
}
