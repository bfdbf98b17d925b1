//! The default [`CryptoProvider`], built on the RustCrypto and dalek crates.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use cipher::{KeyIvInit, StreamCipher};
use digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use signature::Verifier;

use crate::compress;
use crate::config::RSA_MIN_KEYSIZE;
use crate::crypto::*;
use crate::dh::{Curve25519, DhGroup14};
use crate::random;
use crate::sign::{self, PubKey};
use crate::ssh_chapoly::SSHChaPoly;
use crate::sshnames::*;

const KEX: &[&str] = &[
    SSH_NAME_CURVE25519,
    SSH_NAME_CURVE25519_LIBSSH,
    SSH_NAME_DH_GROUP14_SHA256,
    SSH_NAME_DH_GROUP14_SHA1,
];

const HOSTKEY: &[&str] = &[SSH_NAME_ED25519, SSH_NAME_RSA_SHA256, SSH_NAME_RSA];

const CIPHERS: &[&str] = &[
    SSH_NAME_CHAPOLY,
    SSH_NAME_AES256_CTR,
    SSH_NAME_AES192_CTR,
    SSH_NAME_AES128_CTR,
];

const MACS: &[&str] = &[SSH_NAME_HMAC_SHA256, SSH_NAME_HMAC_SHA512, SSH_NAME_HMAC_SHA1];

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Counter mode keeps its keystream position across packets
struct CtrCipher<C>(C);

impl<C: StreamCipher + Send> SshCipher for CtrCipher<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf)
    }
}

fn new_ctr<C: KeyIvInit + StreamCipher + Send + 'static>(
    key: &[u8],
    iv: &[u8],
) -> Result<CipherInstance> {
    let c = C::new_from_slices(key, iv).map_err(|_| Error::BadKey)?;
    Ok(CipherInstance::Stream(Box::new(CtrCipher(c))))
}

/// A keyed HMAC, cloned for each packet
struct HmacMac<M> {
    mac: M,
    len: usize,
}

impl<M: Mac + Clone + Send> SshMac for HmacMac<M> {
    fn mac_len(&self) -> usize {
        self.len
    }

    fn sign(&self, seq: u32, data: &[u8], out: &mut [u8]) {
        let mut m = self.mac.clone();
        m.update(&seq.to_be_bytes());
        m.update(data);
        let r = m.finalize().into_bytes();
        out.copy_from_slice(&r[..self.len]);
    }

    fn verify(&self, seq: u32, data: &[u8], tag: &[u8]) -> Result<()> {
        let mut m = self.mac.clone();
        m.update(&seq.to_be_bytes());
        m.update(data);
        m.verify_slice(tag).map_err(|_| Error::BadDecrypt)
    }
}

fn new_hmac<M: Mac + KeyInit + Clone + Send + 'static>(
    key: &[u8],
    len: usize,
) -> Result<Box<dyn SshMac>> {
    let mac = <M as KeyInit>::new_from_slice(key).map_err(|_| Error::BadKey)?;
    Ok(Box::new(HmacMac { mac, len }))
}

/// Cryptography from RustCrypto `aes`, `ctr`, `chacha20`, `poly1305`, `hmac`,
/// `sha1`, `sha2`, `rsa` crates and `ed25519-dalek`/`x25519-dalek`.
#[derive(Debug, Default, Clone)]
pub struct RustCryptoProvider {}

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self {}
    }

    fn verify_rsa(sha256: bool, e: &[u8], n: &[u8], msg: &[u8], sig: &[u8]) -> Result<()> {
        use rsa::pkcs1v15::{Signature, VerifyingKey};
        use rsa::traits::PublicKeyParts;
        let k = rsa::RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(n),
            rsa::BigUint::from_bytes_be(e),
        )
        .map_err(|e| {
            debug!("Bad RSA key: {e}");
            Error::BadKey
        })?;
        if k.size() * 8 < RSA_MIN_KEYSIZE {
            debug!("RSA key too small, {} bits", k.size() * 8);
            return Err(Error::BadKey);
        }
        let sig = Signature::try_from(sig).map_err(|_| Error::BadSig)?;
        let r = if sha256 {
            VerifyingKey::<Sha256>::new(k).verify(msg, &sig)
        } else {
            VerifyingKey::<Sha1>::new(k).verify(msg, &sig)
        };
        r.map_err(|e| {
            trace!("RSA signature failed: {e}");
            Error::BadSig
        })
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn name(&self) -> &str {
        "rustcrypto"
    }

    fn algorithms(&self, kind: AlgoKind) -> &[&'static str] {
        match kind {
            AlgoKind::Kex => KEX,
            AlgoKind::HostKey => HOSTKEY,
            AlgoKind::Cipher => CIPHERS,
            AlgoKind::Mac => MACS,
            AlgoKind::Compression => compress::NAMES,
        }
    }

    fn cipher_info(&self, name: &str) -> Result<CipherInfo> {
        let (key_len, iv_len, block_size, aead, tag_len) = match name {
            SSH_NAME_CHAPOLY => (SSHChaPoly::KEY_LEN, 0, 8, true, SSHChaPoly::TAG_LEN),
            SSH_NAME_AES256_CTR => (32, 16, 16, false, 0),
            SSH_NAME_AES192_CTR => (24, 16, 16, false, 0),
            SSH_NAME_AES128_CTR => (16, 16, 16, false, 0),
            _ => return Err(Error::UnknownMethod { kind: "cipher" }),
        };
        Ok(CipherInfo { key_len, iv_len, block_size, aead, tag_len })
    }

    fn new_cipher(&self, name: &str, key: &[u8], iv: &[u8], _encrypt: bool)
        -> Result<CipherInstance> {
        match name {
            SSH_NAME_CHAPOLY => {
                Ok(CipherInstance::Aead(Box::new(SSHChaPoly::new_from_slice(key)?)))
            }
            SSH_NAME_AES256_CTR => new_ctr::<Aes256Ctr>(key, iv),
            SSH_NAME_AES192_CTR => new_ctr::<Aes192Ctr>(key, iv),
            SSH_NAME_AES128_CTR => new_ctr::<Aes128Ctr>(key, iv),
            _ => Err(Error::UnknownMethod { kind: "cipher" }),
        }
    }

    fn mac_info(&self, name: &str) -> Result<MacInfo> {
        let (key_len, mac_len) = match name {
            SSH_NAME_HMAC_SHA256 => (32, 32),
            SSH_NAME_HMAC_SHA512 => (64, 64),
            SSH_NAME_HMAC_SHA1 => (20, 20),
            _ => return Err(Error::UnknownMethod { kind: "mac" }),
        };
        Ok(MacInfo { key_len, mac_len })
    }

    fn new_mac(&self, name: &str, key: &[u8]) -> Result<Box<dyn SshMac>> {
        match name {
            SSH_NAME_HMAC_SHA256 => new_hmac::<Hmac<Sha256>>(key, 32),
            SSH_NAME_HMAC_SHA512 => new_hmac::<Hmac<Sha512>>(key, 64),
            SSH_NAME_HMAC_SHA1 => new_hmac::<Hmac<Sha1>>(key, 20),
            _ => Err(Error::UnknownMethod { kind: "mac" }),
        }
    }

    fn new_kex(&self, name: &str) -> Result<Box<dyn SshKex>> {
        match name {
            SSH_NAME_CURVE25519 => Ok(Box::new(Curve25519::new(SSH_NAME_CURVE25519)?)),
            SSH_NAME_CURVE25519_LIBSSH => {
                Ok(Box::new(Curve25519::new(SSH_NAME_CURVE25519_LIBSSH)?))
            }
            SSH_NAME_DH_GROUP14_SHA256 => {
                Ok(Box::new(DhGroup14::new(SSH_NAME_DH_GROUP14_SHA256)?))
            }
            SSH_NAME_DH_GROUP14_SHA1 => Ok(Box::new(DhGroup14::new(SSH_NAME_DH_GROUP14_SHA1)?)),
            _ => Err(Error::UnknownMethod { kind: "kex" }),
        }
    }

    fn hasher(&self, alg: HashAlg) -> Box<dyn digest::DynDigest + Send> {
        match alg {
            HashAlg::Sha1 => Box::new(Sha1::default()),
            HashAlg::Sha256 => Box::new(Sha256::default()),
            HashAlg::Sha512 => Box::new(Sha512::default()),
        }
    }

    fn verify(&self, algo: &str, pubkey_blob: &[u8], msg: &[u8], sig_blob: &[u8])
        -> Result<()> {
        let (sig_algo, sig) = sign::split_sig_blob(sig_blob)?;
        if sig_algo != algo {
            warn!("Received {sig_algo} signature, expecting {algo}");
            return Err(Error::BadSig);
        }
        let key = PubKey::from_blob(pubkey_blob)?;

        match (algo, &key) {
            (SSH_NAME_ED25519, PubKey::Ed25519(k)) => {
                let k = ed25519_dalek::VerifyingKey::from_bytes(k)
                    .map_err(|_| Error::BadKey)?;
                let s: &[u8; 64] = sig.try_into().map_err(|_| Error::BadSig)?;
                let s = ed25519_dalek::Signature::from_bytes(s);
                k.verify(msg, &s).map_err(|_| Error::BadSig)
            }
            (SSH_NAME_RSA_SHA256, PubKey::Rsa { e, n }) => {
                Self::verify_rsa(true, e, n, msg, sig)
            }
            (SSH_NAME_RSA, PubKey::Rsa { e, n }) => Self::verify_rsa(false, e, n, msg, sig),
            _ => {
                warn!("Signature \"{algo}\" doesn't match key type \"{}\"", key.algorithm());
                Err(Error::BadSig)
            }
        }
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        random::fill_random(buf)
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::*;
    use crate::rustcrypto::*;
    use crate::sign::{KeyPair, SignKey};
    use crate::sshlog::init_test_log;

    fn roundtrip_stream(name: &str) {
        let p = RustCryptoProvider::new();
        let info = p.cipher_info(name).unwrap();
        let key = vec![9u8; info.key_len];
        let iv = vec![1u8; info.iv_len];
        let CipherInstance::Stream(mut enc) = p.new_cipher(name, &key, &iv, true).unwrap()
        else {
            panic!("not a stream cipher");
        };
        let CipherInstance::Stream(mut dec) = p.new_cipher(name, &key, &iv, false).unwrap()
        else {
            panic!("not a stream cipher");
        };
        let orig: Vec<u8> = (0..64u8).collect();
        let mut b = orig.clone();
        enc.apply(&mut b[..32]);
        enc.apply(&mut b[32..]);
        assert_ne!(b, orig);
        dec.apply(&mut b);
        assert_eq!(b, orig);
    }

    #[test]
    fn ctr_keeps_position() {
        init_test_log();
        roundtrip_stream(SSH_NAME_AES128_CTR);
        roundtrip_stream(SSH_NAME_AES192_CTR);
        roundtrip_stream(SSH_NAME_AES256_CTR);
    }

    #[test]
    fn hmac_verify() {
        let p = RustCryptoProvider::new();
        for name in MACS {
            let info = p.mac_info(name).unwrap();
            let m = p.new_mac(name, &vec![7u8; info.key_len]).unwrap();
            let mut tag = vec![0u8; m.mac_len()];
            m.sign(3, b"packet", &mut tag);
            m.verify(3, b"packet", &tag).unwrap();
            assert!(m.verify(4, b"packet", &tag).is_err());
            tag[0] ^= 1;
            assert!(matches!(m.verify(3, b"packet", &tag), Err(Error::BadDecrypt)));
        }
    }

    #[test]
    fn hmac_sha256_vector() {
        // RFC4231 test case 2, with the sequence number as the first 4 bytes
        let p = RustCryptoProvider::new();
        let m = p.new_mac(SSH_NAME_HMAC_SHA256, b"Jefe").unwrap();
        let mut tag = [0u8; 32];
        m.sign(u32::from_be_bytes(*b"what"), b" do ya want for nothing?", &mut tag);
        assert_eq!(
            tag[..4],
            [0x5b, 0xdc, 0xc1, 0x46]
        );
    }

    #[test]
    fn verify_signatures() {
        init_test_log();
        let p = RustCryptoProvider::new();
        let ed = KeyPair::generate_ed25519().unwrap();
        let rsa = KeyPair::generate_rsa(1024).unwrap();
        let msg = b"exchange hash";

        let sig = ed.sign(SSH_NAME_ED25519, msg).unwrap();
        p.verify(SSH_NAME_ED25519, &ed.public_blob(), msg, &sig).unwrap();
        assert!(p.verify(SSH_NAME_ED25519, &ed.public_blob(), b"other", &sig).is_err());

        for algo in [SSH_NAME_RSA_SHA256, SSH_NAME_RSA] {
            let sig = rsa.sign(algo, msg).unwrap();
            p.verify(algo, &rsa.public_blob(), msg, &sig).unwrap();
        }

        // algorithm named in the blob must match
        let sig = rsa.sign(SSH_NAME_RSA, msg).unwrap();
        assert!(p.verify(SSH_NAME_RSA_SHA256, &rsa.public_blob(), msg, &sig).is_err());
        // key type must match
        let sig = ed.sign(SSH_NAME_ED25519, msg).unwrap();
        assert!(p.verify(SSH_NAME_ED25519, &rsa.public_blob(), msg, &sig).is_err());
    }
}
