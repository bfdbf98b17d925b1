//! Ephemeral key agreement for `diffie-hellman-group14-*` and `curve25519-sha256`.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::OnceLock;

use num_bigint::BigUint;
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::crypto::{HashAlg, SshKex};
use crate::random;
use crate::sshnames::*;

/// RFC3526 2048-bit MODP Group, id 14
const GROUP14_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
    C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
    83655D23DCA3AD961C62F356208552BB9ED529077096966D\
    670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
    DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
    15728E5A8AACAA68FFFFFFFFFFFFFFFF";

const GROUP14_GENERATOR: u32 = 2;

/// Private exponent size. Twice the 256 bit strength of kex hashes.
const DH_PRIVATE_LEN: usize = 64;

fn group14_prime() -> Result<&'static BigUint> {
    static P: OnceLock<Option<BigUint>> = OnceLock::new();
    P.get_or_init(|| BigUint::parse_bytes(GROUP14_PRIME.as_bytes(), 16))
        .as_ref()
        .trap()
}

/// Big-endian bytes with a leading zero if the high bit is set,
/// the body of an SSH mpint.
fn mpint_body(n: &BigUint) -> Vec<u8> {
    let mut b = n.to_bytes_be();
    if b.first().is_some_and(|c| c & 0x80 != 0) {
        b.insert(0, 0);
    }
    b
}

/// Finite field Diffie-Hellman over group 14
pub struct DhGroup14 {
    name: &'static str,
    hash: HashAlg,
    x: Zeroizing<Vec<u8>>,
    e: Vec<u8>,
}

impl DhGroup14 {
    pub fn new(name: &'static str) -> Result<Self> {
        let hash = match name {
            SSH_NAME_DH_GROUP14_SHA256 => HashAlg::Sha256,
            SSH_NAME_DH_GROUP14_SHA1 => HashAlg::Sha1,
            _ => return Err(Error::UnknownMethod { kind: "kex" }),
        };
        let p = group14_prime()?;

        let mut x = Zeroizing::new(vec![0u8; DH_PRIVATE_LEN]);
        random::fill_random(&mut x)?;
        // x in [2, 2^512), well below p-1
        x[DH_PRIVATE_LEN - 1] |= 2;
        let xn = BigUint::from_bytes_be(&x);
        let e = BigUint::from(GROUP14_GENERATOR).modpow(&xn, p);
        Ok(Self { name, hash, x, e: mpint_body(&e) })
    }
}

impl SshKex for DhGroup14 {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hash_alg(&self) -> HashAlg {
        self.hash
    }

    fn public(&self) -> &[u8] {
        &self.e
    }

    fn agree(self: Box<Self>, peer: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let p = group14_prime()?;
        if peer.first().is_some_and(|c| c & 0x80 != 0) {
            debug!("Negative DH value");
            return Err(Error::BadKex);
        }
        let f = BigUint::from_bytes_be(peer);
        let one = BigUint::from(1u32);
        // RFC4253 section 8, values outside [2, p-2] are rejected
        if f <= one || f >= p - &one {
            debug!("DH value out of range");
            return Err(Error::BadKex);
        }
        let x = BigUint::from_bytes_be(&self.x);
        let k = f.modpow(&x, p);
        Ok(Zeroizing::new(k.to_bytes_be()))
    }
}

/// `curve25519-sha256`, RFC8731
pub struct Curve25519 {
    name: &'static str,
    secret: x25519_dalek::EphemeralSecret,
    public: [u8; 32],
}

impl Curve25519 {
    pub fn new(name: &'static str) -> Result<Self> {
        if !matches!(name, SSH_NAME_CURVE25519 | SSH_NAME_CURVE25519_LIBSSH) {
            return Err(Error::UnknownMethod { kind: "kex" });
        }
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
        Ok(Self { name, secret, public })
    }
}

impl SshKex for Curve25519 {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hash_alg(&self) -> HashAlg {
        HashAlg::Sha256
    }

    fn public(&self) -> &[u8] {
        &self.public
    }

    fn agree(self: Box<Self>, peer: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let peer: [u8; 32] = peer.try_into().map_err(|_| {
            debug!("Bad curve25519 length {}", peer.len());
            Error::BadKex
        })?;
        let peer = x25519_dalek::PublicKey::from(peer);
        let shared = self.secret.diffie_hellman(&peer);
        // RFC8731 requires rejecting an all-zero result
        if !shared.was_contributory() {
            debug!("Non-contributory curve25519 key");
            return Err(Error::BadKex);
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use crate::dh::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn group14_agrees() {
        init_test_log();
        for name in [SSH_NAME_DH_GROUP14_SHA256, SSH_NAME_DH_GROUP14_SHA1] {
            let a = Box::new(DhGroup14::new(name).unwrap());
            let b = Box::new(DhGroup14::new(name).unwrap());
            let pa = a.public().to_vec();
            let pb = b.public().to_vec();
            assert_ne!(pa, pb);
            let ka = a.agree(&pb).unwrap();
            let kb = b.agree(&pa).unwrap();
            assert_eq!(*ka, *kb);
        }
    }

    #[test]
    fn group14_rejects_degenerate() {
        let p = group14_prime().unwrap();
        let one = BigUint::from(1u32);
        for bad in [BigUint::from(0u32), one.clone(), p - &one, p.clone()] {
            let a = Box::new(DhGroup14::new(SSH_NAME_DH_GROUP14_SHA256).unwrap());
            assert!(matches!(a.agree(&mpint_body(&bad)), Err(Error::BadKex)));
        }
        // negative
        let a = Box::new(DhGroup14::new(SSH_NAME_DH_GROUP14_SHA256).unwrap());
        assert!(a.agree(&[0x80, 1]).is_err());
    }

    #[test]
    fn group14_public_is_mpint() {
        let a = DhGroup14::new(SSH_NAME_DH_GROUP14_SHA1).unwrap();
        let e = a.public();
        // no redundant leading zero
        assert!(e[0] != 0 || e[1] & 0x80 != 0);
        assert!(e[0] & 0x80 == 0);
    }

    #[test]
    fn curve25519_agrees() {
        init_test_log();
        let a = Box::new(Curve25519::new(SSH_NAME_CURVE25519).unwrap());
        let b = Box::new(Curve25519::new(SSH_NAME_CURVE25519_LIBSSH).unwrap());
        let pa = a.public().to_vec();
        let pb = b.public().to_vec();
        let ka = a.agree(&pb).unwrap();
        let kb = b.agree(&pa).unwrap();
        assert_eq!(*ka, *kb);
        assert_eq!(ka.len(), 32);
    }

    #[test]
    fn curve25519_rejects_bad() {
        let a = Box::new(Curve25519::new(SSH_NAME_CURVE25519).unwrap());
        assert!(a.agree(&[1u8; 31]).is_err());
        // small order point
        let a = Box::new(Curve25519::new(SSH_NAME_CURVE25519).unwrap());
        assert!(a.agree(&[0u8; 32]).is_err());
    }
}
