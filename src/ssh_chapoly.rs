#[allow(unused_imports)]
use {
    crate::error::*,
    log::{debug, error, info, log, trace, warn},
};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use digest::KeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::crypto::SshAead;
use crate::encrypt::SSH_LENGTH_SIZE;

#[derive(Clone, ZeroizeOnDrop)]
/// `chacha20-poly1305@openssh.com` authenticated cipher
pub struct SSHChaPoly {
    /// Length key
    k1: [u8; 32],
    /// Packet key
    k2: [u8; 32],
}

impl SSHChaPoly {
    pub const TAG_LEN: usize = 16;
    pub const KEY_LEN: usize = 64;

    /// `key` must be 64 bytes
    pub fn new_from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != Self::KEY_LEN {
            return Err(Error::BadKey);
        }
        let mut k1 = [0u8; 32];
        let mut k2 = [0u8; 32];
        k1.copy_from_slice(&key[32..64]);
        k2.copy_from_slice(&key[..32]);
        Ok(Self { k1, k2 })
    }

    // The 64 bit sequence nonce sits in the low bytes of the IETF nonce,
    // the counter never reaches 2^32 blocks.
    fn cha20(key: &[u8; 32], seq: u32) -> ChaCha20 {
        let mut nonce = [0u8; 12];
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        ChaCha20::new(key.into(), (&nonce).into())
    }

    fn poly_tag(c: &mut ChaCha20, msg: &[u8]) -> poly1305::Tag {
        let mut poly_key = [0u8; 32];
        c.seek(0u32);
        c.apply_keystream(&mut poly_key);
        let poly = Poly1305::new((&poly_key).into());
        // compute_unpadded() adds the necessary trailing 1 byte when padding output
        poly.compute_unpadded(msg)
    }
}

impl SshAead for SSHChaPoly {
    fn tag_len(&self) -> usize {
        Self::TAG_LEN
    }

    fn open_length(&self, seq: u32, buf: &[u8]) -> Result<u32> {
        let mut b = [0u8; SSH_LENGTH_SIZE];
        b.copy_from_slice(buf.get(..SSH_LENGTH_SIZE).ok_or(Error::BadDecrypt)?);
        let mut c = Self::cha20(&self.k1, seq);
        c.apply_keystream(&mut b);
        Ok(u32::from_be_bytes(b))
    }

    fn open(&self, seq: u32, msg: &mut [u8], mac: &[u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || mac.len() != Self::TAG_LEN {
            return Err(Error::BadDecrypt);
        }

        let mut c = Self::cha20(&self.k2, seq);

        // check tag
        let msg_tag = poly1305::Tag::from_slice(mac);
        let tag = Self::poly_tag(&mut c, msg);
        let good: bool = tag.ct_eq(msg_tag).into();
        if !good {
            return Err(Error::BadDecrypt);
        }

        // decrypt payload
        let (_, payload) = msg.split_at_mut(SSH_LENGTH_SIZE);
        // set block counter to 1
        c.seek(64u32);
        c.apply_keystream(payload);
        Ok(())
    }

    fn seal(&self, seq: u32, msg: &mut [u8], mac: &mut [u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || mac.len() != Self::TAG_LEN {
            return Err(Error::bug());
        }

        // encrypt length
        let mut c = Self::cha20(&self.k1, seq);
        c.apply_keystream(&mut msg[..SSH_LENGTH_SIZE]);

        // encrypt payload
        let mut c = Self::cha20(&self.k2, seq);
        let (_, payload) = msg.split_at_mut(SSH_LENGTH_SIZE);
        // set block counter to 1
        c.seek(64u32);
        c.apply_keystream(payload);

        let tag = Self::poly_tag(&mut c, msg);
        mac.copy_from_slice(tag.as_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::SshAead;
    use crate::ssh_chapoly::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn seal_open() {
        init_test_log();
        let key: Vec<u8> = (0..64).collect();
        let c = SSHChaPoly::new_from_slice(&key).unwrap();
        let mut msg = vec![0, 0, 0, 12, 7, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        let orig = msg.clone();
        let mut tag = [0u8; SSHChaPoly::TAG_LEN];
        c.seal(44, &mut msg, &mut tag).unwrap();
        assert_ne!(msg, orig);
        assert_eq!(c.open_length(44, &msg).unwrap(), 12);

        // wrong sequence number fails
        let mut m2 = msg.clone();
        assert!(c.open(45, &mut m2, &tag).is_err());

        let mut bad = msg.clone();
        bad[9] ^= 0x10;
        assert!(matches!(c.open(44, &mut bad, &tag), Err(Error::BadDecrypt)));

        c.open(44, &mut msg, &tag).unwrap();
        assert_eq!(msg[4..], orig[4..]);
    }

    #[test]
    fn bad_key_len() {
        assert!(SSHChaPoly::new_from_slice(&[0u8; 32]).is_err());
    }
}
