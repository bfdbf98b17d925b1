//! Handles encryption/decryption and framing a payload in a SSH packet.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use core::num::Wrapping;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::buffer::SshBuffer;
use crate::compress::{CompressMode, Compressor, Decompressor};
use crate::config::MAX_PACKET_LEN;
use crate::crypto::{CipherInstance, CryptoProvider, HashAlg, SshMac};
use crate::sshwire::hash_mpint;

// RFC4253 Section 6. Including length u32 length field, excluding MAC
const SSH_MIN_PACKET_SIZE: usize = 16;
const SSH_MIN_PADLEN: usize = 4;
const SSH_MIN_BLOCK: usize = 8;
pub const SSH_LENGTH_SIZE: usize = 4;
pub const SSH_PAYLOAD_START: usize = SSH_LENGTH_SIZE + 1;

/// Algorithm names negotiated for a single direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirAlgos {
    pub cipher: &'static str,
    /// `None` for AEAD ciphers
    pub mac: Option<&'static str>,
    pub comp: CompressMode,
}

/// Cipher and integrity state for one direction
pub(crate) struct DirKeys {
    cipher: Option<CipherInstance>,
    mac: Option<Box<dyn SshMac>>,
    block: usize,
    comp: CompressMode,
    algos: Option<DirAlgos>,
}

impl DirKeys {
    fn cleartext() -> Self {
        DirKeys {
            cipher: None,
            mac: None,
            block: SSH_MIN_BLOCK,
            comp: CompressMode::None,
            algos: None,
        }
    }

    /// `letters` are the RFC4253 7.2 derivation letters for iv, key, integrity.
    fn new(
        provider: &dyn CryptoProvider,
        algos: &DirAlgos,
        derive: &Derive,
        letters: [u8; 3],
        encrypt: bool,
    ) -> Result<Self> {
        let [l_iv, l_key, l_integ] = letters;
        let info = provider.cipher_info(algos.cipher)?;
        let iv = derive.key(l_iv, info.iv_len);
        let key = derive.key(l_key, info.key_len);
        let cipher = provider.new_cipher(algos.cipher, &key, &iv, encrypt)?;

        let mac = if info.aead {
            None
        } else {
            // negotiation always picks a MAC for non-AEAD ciphers
            let name = algos.mac.trap()?;
            let mi = provider.mac_info(name)?;
            let ikey = derive.key(l_integ, mi.key_len);
            Some(provider.new_mac(name, &ikey)?)
        };

        Ok(DirKeys {
            cipher: Some(cipher),
            mac,
            block: info.block_size.max(SSH_MIN_BLOCK),
            comp: algos.comp,
            algos: Some(algos.clone()),
        })
    }

    fn is_aead(&self) -> bool {
        matches!(self.cipher, Some(CipherInstance::Aead(_)))
    }

    fn size_integ(&self) -> usize {
        match (&self.cipher, &self.mac) {
            (Some(CipherInstance::Aead(a)), _) => a.tag_len(),
            (_, Some(m)) => m.mac_len(),
            _ => 0,
        }
    }

    /// Padding is required to meet
    /// - minimum packet length
    /// - minimum padding size,
    /// - encrypted length being a multiple of block length
    fn calc_encrypt_pad(&self, payload_len: usize) -> usize {
        let size_block = self.block;
        // aead ciphers don't include the initial length field in encrypted blocks
        let len = 1 + payload_len + if self.is_aead() { 0 } else { SSH_LENGTH_SIZE };

        // round padding length upwards so that len is a multiple of block size
        let mut padlen = size_block - len % size_block;

        if padlen < SSH_MIN_PADLEN {
            padlen += size_block
        }

        // The minimum size of a packet is 16 (plus mac)
        if SSH_LENGTH_SIZE + 1 + payload_len + padlen < SSH_MIN_PACKET_SIZE {
            padlen += size_block;
        }
        padlen
    }
}

impl fmt::Debug for DirKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.algos {
            Some(a) => write!(f, "{} {} {:?}", a.cipher, a.mac.unwrap_or("(aead)"), a.comp),
            None => f.write_str("cleartext"),
        }
    }
}

/// Hashes for key derivation, RFC4253 section 7.2
struct Derive<'a> {
    provider: &'a dyn CryptoProvider,
    hash: HashAlg,
    k: &'a [u8],
    h: &'a [u8],
    sess_id: &'a [u8],
}

impl Derive<'_> {
    fn key(&self, letter: u8, len: usize) -> Zeroizing<Vec<u8>> {
        // sized so extending never reallocates
        let mut out = Zeroizing::new(Vec::with_capacity(len + self.hash.output_len()));

        // K1 = HASH(K || H || letter || session_id)
        let mut hc = self.provider.hasher(self.hash);
        hash_mpint(hc.as_mut(), self.k);
        hc.update(self.h);
        hc.update(&[letter]);
        hc.update(self.sess_id);
        out.extend_from_slice(&Zeroizing::new(hc.finalize()));

        // Kn = HASH(K || H || K1 || ... || Kn-1)
        while out.len() < len {
            let mut hc = self.provider.hasher(self.hash);
            hash_mpint(hc.as_mut(), self.k);
            hc.update(self.h);
            hc.update(&out);
            let more = Zeroizing::new(hc.finalize());
            out.extend_from_slice(&more);
        }
        out.truncate(len);
        out
    }
}

/// Newly derived keys for both directions, not yet in use
pub(crate) struct Keys {
    pub enc: DirKeys,
    pub dec: DirKeys,
}

impl Keys {
    /// Derives keys from the shared secret `k` and exchange hash `h`.
    pub fn derive(
        provider: &dyn CryptoProvider,
        hash: HashAlg,
        k: &[u8],
        h: &[u8],
        sess_id: &[u8],
        is_client: bool,
        enc: &DirAlgos,
        dec: &DirAlgos,
    ) -> Result<Self> {
        let derive = Derive { provider, hash, k, h, sess_id };
        // client to server uses A, C, E
        let (c2s, s2c) = ([b'A', b'C', b'E'], [b'B', b'D', b'F']);
        let (le, ld) = if is_client { (c2s, s2c) } else { (s2c, c2s) };
        Ok(Keys {
            enc: DirKeys::new(provider, enc, &derive, le, true)?,
            dec: DirKeys::new(provider, dec, &derive, ld, false)?,
        })
    }
}

/// Stateful keys and sequence numbers, a single instance
/// is kept for the entire session.
///
/// The directions are swapped to new keys independently, encryption
/// after we send NEWKEYS and decryption after we receive it.
pub(crate) struct KeyState {
    enc: DirKeys,
    dec: DirKeys,
    next_enc: Option<DirKeys>,
    next_dec: Option<DirKeys>,
    compress: Option<Compressor>,
    decompress: Option<Decompressor>,
    /// Delayed compression may start
    authed: bool,
    // Packet sequence numbers. These don't reset with rekeying.
    seq_encrypt: Wrapping<u32>,
    seq_decrypt: Wrapping<u32>,
    // Traffic since the last key change, for rekeying
    bytes_enc: u64,
    bytes_dec: u64,
    provider: Arc<dyn CryptoProvider>,
}

impl KeyState {
    /// A brand new `KeyState` with no encryption, zero sequence numbers
    pub fn new_cleartext(provider: Arc<dyn CryptoProvider>) -> Self {
        KeyState {
            enc: DirKeys::cleartext(),
            dec: DirKeys::cleartext(),
            next_enc: None,
            next_dec: None,
            compress: None,
            decompress: None,
            authed: false,
            seq_encrypt: Wrapping(0),
            seq_decrypt: Wrapping(0),
            bytes_enc: 0,
            bytes_dec: 0,
            provider,
        }
    }

    /// Whether outbound packets are unencrypted
    pub fn is_cleartext(&self) -> bool {
        self.enc.cipher.is_none()
    }

    /// Stores keys from a key exchange, to be activated per direction.
    pub fn set_next(&mut self, keys: Keys) {
        self.next_enc = Some(keys.enc);
        self.next_dec = Some(keys.dec);
    }

    /// Switches outbound packets to the new keys. Called after sending NEWKEYS.
    pub fn activate_enc(&mut self) -> Result<()> {
        self.enc = self.next_enc.take().trap()?;
        self.bytes_enc = 0;
        // an existing zlib stream carries on over a rekey
        if self.enc.comp.active_at_newkeys(self.authed) {
            self.compress.get_or_insert_with(Compressor::new);
        } else {
            self.compress = None;
        }
        debug!("Outbound keys now {:?}", self.enc);
        Ok(())
    }

    /// Switches inbound packets to the new keys. Called after receiving NEWKEYS.
    pub fn activate_dec(&mut self) -> Result<()> {
        self.dec = self.next_dec.take().trap()?;
        self.bytes_dec = 0;
        if self.dec.comp.active_at_newkeys(self.authed) {
            self.decompress.get_or_insert_with(Decompressor::new);
        } else {
            self.decompress = None;
        }
        debug!("Inbound keys now {:?}", self.dec);
        Ok(())
    }

    /// Starts `zlib@openssh.com` compression once authentication succeeds.
    ///
    /// Must be called immediately after sending or receiving USERAUTH_SUCCESS.
    pub fn enable_delayed_compression(&mut self) {
        self.authed = true;
        if self.enc.comp == CompressMode::ZlibDelayed && self.compress.is_none() {
            debug!("Starting delayed outbound compression");
            self.compress = Some(Compressor::new());
        }
        if self.dec.comp == CompressMode::ZlibDelayed && self.decompress.is_none() {
            debug!("Starting delayed inbound compression");
            self.decompress = Some(Decompressor::new());
        }
    }

    pub fn recv_seq(&self) -> u32 {
        self.seq_decrypt.0
    }

    pub fn send_seq(&self) -> u32 {
        self.seq_encrypt.0
    }

    /// Whether either direction has carried `limit` bytes under the current keys
    pub fn rekey_due(&self, limit: u64) -> bool {
        (self.enc.cipher.is_some() && self.bytes_enc >= limit)
            || (self.dec.cipher.is_some() && self.bytes_dec >= limit)
    }

    /// Size of the first read, enough to learn the packet length.
    pub fn size_block_dec(&self) -> usize {
        self.dec.block
    }

    /// Decrypts the first block in the buffer, returning the total packet length
    /// including the length field and MAC.
    pub fn decrypt_first_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        let seq = self.seq_decrypt.0;
        let d = &mut self.dec;
        if buf.len() < d.block {
            return Err(Error::bug());
        }

        let len = match &mut d.cipher {
            Some(CipherInstance::Aead(a)) => a.open_length(seq, buf)?,
            Some(CipherInstance::Stream(c)) => {
                c.apply(&mut buf[..d.block]);
                read_length(buf)
            }
            None => read_length(buf),
        } as usize;

        if len > MAX_PACKET_LEN {
            debug!("Packet length {len} too large");
            return Err(Error::BigPacket { size: len });
        }
        // the first block must be within the packet
        if len + SSH_LENGTH_SIZE < d.block {
            debug!("Packet length {len} shorter than a block");
            return Err(Error::SSHProtoError);
        }

        Ok(SSH_LENGTH_SIZE + len + d.size_integ())
    }

    /// Decrypt the whole packet buffer and validate AEAD Tag or MAC.
    /// Returns the payload length, still compressed if compression is active.
    /// The first block must already have been passed to
    /// [`decrypt_first_block`](Self::decrypt_first_block).
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize> {
        let seq = self.seq_decrypt.0;
        let d = &mut self.dec;
        let size_block = d.block;
        let size_integ = d.size_integ();
        let total = buf.len();

        if total < size_block + size_integ || total < SSH_MIN_PACKET_SIZE + size_integ {
            debug!("Bad packet, {total} smaller than minimum");
            return Err(Error::SSHProtoError);
        }
        // "MUST be a multiple of the cipher block size".
        // encrypted length for aead ciphers doesn't include the length prefix.
        let sublength = if d.is_aead() { SSH_LENGTH_SIZE } else { 0 };
        if (total - size_integ - sublength) % size_block != 0 {
            debug!("Bad packet, not multiple of block size");
            return Err(Error::SSHProtoError);
        }

        let (data, mac) = buf.split_at_mut(total - size_integ);

        match &mut d.cipher {
            Some(CipherInstance::Aead(a)) => {
                a.open(seq, data, mac).map_err(|_| {
                    info!("Packet integrity failed");
                    Error::BadDecrypt
                })?;
            }
            Some(CipherInstance::Stream(c)) => c.apply(&mut data[size_block..]),
            None => {}
        }

        if let Some(m) = &d.mac {
            m.verify(seq, data, mac).map_err(|_| {
                info!("Packet integrity failed");
                Error::BadDecrypt
            })?;
        }

        let padlen = data[SSH_LENGTH_SIZE] as usize;
        if padlen < SSH_MIN_PADLEN {
            debug!("Packet padding too short");
            return Err(Error::SSHProtoError);
        }

        let payload_len =
            total.checked_sub(SSH_PAYLOAD_START + size_integ + padlen).ok_or_else(|| {
                debug!("Bad padding length");
                Error::SSHProtoError
            })?;

        self.seq_decrypt += 1;
        self.bytes_dec += total as u64;
        Ok(payload_len)
    }

    /// Decompresses a received payload into `out`.
    ///
    /// Returns `false` without touching `out` when inbound compression is inactive.
    pub fn inflate(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        match self.decompress.as_mut() {
            Some(d) => {
                d.decompress(payload, out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Compresses, frames and encrypts `payload`, appending the packet to `out`.
    /// Returns the packet length.
    pub fn encrypt_packet(&mut self, payload: &[u8], out: &mut SshBuffer) -> Result<usize> {
        let mut z = Zeroizing::new(Vec::new());
        let payload = match self.compress.as_mut() {
            Some(c) => {
                c.compress(payload, &mut z)?;
                z.as_slice()
            }
            None => payload,
        };
        let padlen = self.enc.calc_encrypt_pad(payload.len());
        if 1 + payload.len() + padlen > MAX_PACKET_LEN {
            return Err(Error::BigPacket { size: payload.len() });
        }
        let total = SSH_PAYLOAD_START + payload.len() + padlen + self.enc.size_integ();
        let start = out.len();
        out.resize(start + total);
        let buf = &mut out.as_mut_slice()[start..];
        buf[SSH_PAYLOAD_START..][..payload.len()].copy_from_slice(payload);
        self.encrypt(payload.len(), buf)
    }

    /// Encrypt a buffer in-place, adding packet size, padding, MAC etc.
    /// The payload is already at [`SSH_PAYLOAD_START`].
    /// Returns the total length.
    fn encrypt(&mut self, payload_len: usize, buf: &mut [u8]) -> Result<usize> {
        let seq = self.seq_encrypt.0;
        let e = &mut self.enc;
        let size_block = e.block;
        let size_integ = e.size_integ();
        let padlen = e.calc_encrypt_pad(payload_len);
        // len is everything except the MAC
        let len = SSH_PAYLOAD_START + payload_len + padlen;

        if e.is_aead() {
            debug_assert_eq!((len - SSH_LENGTH_SIZE) % size_block, 0);
        } else {
            debug_assert_eq!(len % size_block, 0);
        };

        if len + size_integ > buf.len() {
            error!("Output buffer {} is too small for packet", buf.len());
            return Err(Error::NoRoom);
        }

        buf[..SSH_LENGTH_SIZE].copy_from_slice(&((len - SSH_LENGTH_SIZE) as u32).to_be_bytes());
        buf[SSH_LENGTH_SIZE] = padlen as u8;
        let pad_start = SSH_PAYLOAD_START + payload_len;
        self.provider.fill_random(&mut buf[pad_start..len])?;

        let (enc, rest) = buf.split_at_mut(len);
        let mac = &mut rest[..size_integ];

        // encrypt-and-MAC, over the plaintext
        if let Some(m) = &e.mac {
            m.sign(seq, enc, mac);
        }

        match &mut e.cipher {
            Some(CipherInstance::Aead(a)) => a.seal(seq, enc, mac)?,
            Some(CipherInstance::Stream(c)) => c.apply(enc),
            None => {}
        }

        self.seq_encrypt += 1;
        self.bytes_enc += (len + size_integ) as u64;
        Ok(len + size_integ)
    }
}

fn read_length(buf: &[u8]) -> u32 {
    let mut l = [0u8; SSH_LENGTH_SIZE];
    l.copy_from_slice(&buf[..SSH_LENGTH_SIZE]);
    u32::from_be_bytes(l)
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyState")
            .field("enc", &self.enc)
            .field("dec", &self.dec)
            .field("seq_encrypt", &self.seq_encrypt.0)
            .field("seq_decrypt", &self.seq_decrypt.0)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::crypto::{default_provider, HashAlg};
    use crate::encrypt::*;
    use crate::error::Error;
    use crate::sshlog::init_test_log;
    use crate::sshnames::*;
    #[allow(unused_imports)]
    use pretty_hex::PrettyHex;

    /// Decodes one packet from the front of `v`, returning the payload.
    fn decode(ks: &mut KeyState, v: &mut [u8]) -> Result<Vec<u8>> {
        let total = ks.decrypt_first_block(v)?;
        if total != v.len() {
            return Err(Error::SSHProtoError);
        }
        let plen = ks.decrypt(v)?;
        let payload = &v[SSH_PAYLOAD_START..SSH_PAYLOAD_START + plen];
        let mut out = Vec::new();
        if ks.inflate(payload, &mut out)? {
            Ok(out)
        } else {
            Ok(payload.to_vec())
        }
    }

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn do_roundtrips(ke: &mut KeyState, kd: &mut KeyState, sizes: impl Iterator<Item = usize>) {
        for i in sizes {
            let payload = test_payload(i);
            let mut out = SshBuffer::new();
            let l = ke.encrypt_packet(&payload, &mut out).unwrap();
            assert_eq!(l, out.len());

            let mut v = out.as_slice().to_vec();
            // block alignment after the length field for aead, including it otherwise
            let after = v.len() - ke.enc.size_integ();
            let aligned = if ke.enc.is_aead() { after - SSH_LENGTH_SIZE } else { after };
            assert_eq!(aligned % ke.enc.block, 0);

            let dec = decode(kd, &mut v).unwrap();
            assert_eq!(dec, payload);
        }
    }

    /// A pair of key states, client encrypting and server decrypting
    pub(crate) fn keyed_pair(algos: &DirAlgos) -> (KeyState, KeyState) {
        let p = default_provider();
        let mut ke = KeyState::new_cleartext(p.clone());
        let mut kd = KeyState::new_cleartext(p.clone());
        // arbitrary values
        let k = b"shared secret";
        let h = b"some exchange hash";
        let sess_id = b"some sessid";

        let cli = Keys::derive(p.as_ref(), HashAlg::Sha256, k, h, sess_id, true, algos, algos)
            .unwrap();
        let serv = Keys::derive(p.as_ref(), HashAlg::Sha256, k, h, sess_id, false, algos, algos)
            .unwrap();
        ke.set_next(cli);
        ke.activate_enc().unwrap();
        kd.set_next(serv);
        kd.activate_dec().unwrap();
        (ke, kd)
    }

    pub(crate) fn algo_combos() -> Vec<DirAlgos> {
        let mut v = vec![];
        for comp in [CompressMode::None, CompressMode::Zlib] {
            v.push(DirAlgos { cipher: SSH_NAME_CHAPOLY, mac: None, comp });
            for cipher in [SSH_NAME_AES128_CTR, SSH_NAME_AES192_CTR, SSH_NAME_AES256_CTR] {
                for mac in [SSH_NAME_HMAC_SHA1, SSH_NAME_HMAC_SHA256, SSH_NAME_HMAC_SHA512] {
                    v.push(DirAlgos { cipher, mac: Some(mac), comp });
                }
            }
        }
        v
    }

    #[test]
    fn roundtrip_nocipher() {
        init_test_log();
        // check padding works
        let p = default_provider();
        let mut ke = KeyState::new_cleartext(p.clone());
        let mut kd = KeyState::new_cleartext(p);
        do_roundtrips(&mut ke, &mut kd, 0..80);
        assert_eq!(kd.recv_seq(), 80);
    }

    #[test]
    fn algo_roundtrips() {
        init_test_log();
        for algos in algo_combos() {
            trace!("algos {algos:?}");
            let (mut ke, mut kd) = keyed_pair(&algos);
            do_roundtrips(&mut ke, &mut kd, 0..80);
            do_roundtrips(&mut ke, &mut kd, [1000, 32768, 100_000].into_iter());
        }
    }

    #[test]
    fn largest_payload() {
        let algos = DirAlgos { cipher: SSH_NAME_AES256_CTR, mac: Some(SSH_NAME_HMAC_SHA256), comp: CompressMode::None };
        let (mut ke, mut kd) = keyed_pair(&algos);
        do_roundtrips(&mut ke, &mut kd, [MAX_PACKET_LEN - 64].into_iter());

        let mut out = SshBuffer::new();
        let big = vec![0u8; MAX_PACKET_LEN + 1];
        assert!(matches!(ke.encrypt_packet(&big, &mut out), Err(Error::BigPacket { .. })));
    }

    #[test]
    fn tamper_rejected() {
        init_test_log();
        for algos in algo_combos() {
            let payload = test_payload(50);
            let (mut ke, _) = keyed_pair(&algos);
            let mut out = SshBuffer::new();
            ke.encrypt_packet(&payload, &mut out).unwrap();
            let orig = out.as_slice().to_vec();

            // any single bit after the length field
            for pos in [SSH_LENGTH_SIZE, SSH_PAYLOAD_START, 20, orig.len() - 1] {
                for bit in [0x01, 0x80] {
                    let (_, mut kd) = keyed_pair(&algos);
                    let mut v = orig.clone();
                    v[pos] ^= bit;
                    let r = decode(&mut kd, &mut v);
                    assert!(
                        matches!(r, Err(Error::BadDecrypt) | Err(Error::SSHProtoError)),
                        "{algos:?} pos {pos} {r:?}"
                    );
                    assert_eq!(kd.recv_seq(), 0);
                }
            }
        }
    }

    #[test]
    fn sequence_numbers() {
        let algos = DirAlgos { cipher: SSH_NAME_CHAPOLY, mac: None, comp: CompressMode::None };
        let (mut ke, mut kd) = keyed_pair(&algos);
        ke.seq_encrypt = Wrapping(u32::MAX - 2);
        kd.seq_decrypt = Wrapping(u32::MAX - 2);
        do_roundtrips(&mut ke, &mut kd, 0..5);
        assert_eq!(ke.send_seq(), 2);
        assert_eq!(kd.recv_seq(), 2);

        // out of step sequence numbers fail integrity
        kd.seq_decrypt += 1;
        let mut out = SshBuffer::new();
        ke.encrypt_packet(b"x", &mut out).unwrap();
        let mut v = out.as_slice().to_vec();
        assert!(decode(&mut kd, &mut v).is_err());
    }

    #[test]
    fn oversize_length_rejected() {
        let p = default_provider();
        let mut kd = KeyState::new_cleartext(p);
        let mut v = vec![0u8; 16];
        v[..4].copy_from_slice(&((MAX_PACKET_LEN + 1) as u32).to_be_bytes());
        assert!(matches!(kd.decrypt_first_block(&mut v), Err(Error::BigPacket { .. })));
        v[..4].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(kd.decrypt_first_block(&mut v), Err(Error::SSHProtoError)));
    }

    #[test]
    fn delayed_compression() {
        init_test_log();
        let algos = DirAlgos {
            cipher: SSH_NAME_AES128_CTR,
            mac: Some(SSH_NAME_HMAC_SHA1),
            comp: CompressMode::ZlibDelayed,
        };
        let (mut ke, mut kd) = keyed_pair(&algos);
        let payload = vec![b'z'; 2000];

        let mut out = SshBuffer::new();
        let before = ke.encrypt_packet(&payload, &mut out).unwrap();
        let mut v = out.as_slice().to_vec();
        assert_eq!(decode(&mut kd, &mut v).unwrap(), payload);

        ke.enable_delayed_compression();
        kd.enable_delayed_compression();
        let mut out = SshBuffer::new();
        let after = ke.encrypt_packet(&payload, &mut out).unwrap();
        assert!(after < before / 4);
        let mut v = out.as_slice().to_vec();
        assert_eq!(decode(&mut kd, &mut v).unwrap(), payload);
    }

    #[test]
    fn rekey_counter() {
        let algos = DirAlgos { cipher: SSH_NAME_CHAPOLY, mac: None, comp: CompressMode::None };
        let (mut ke, mut kd) = keyed_pair(&algos);
        assert!(!ke.rekey_due(1000));
        do_roundtrips(&mut ke, &mut kd, [600, 600].into_iter());
        assert!(ke.rekey_due(1000));
        // only inbound keys are active
        assert!(kd.is_cleartext());
        assert!(kd.rekey_due(1000));
        assert!(!kd.rekey_due(10_000));

        // cleartext never counts towards a rekey
        let mut kc = KeyState::new_cleartext(default_provider());
        kc.bytes_enc = 5000;
        kc.bytes_dec = 5000;
        assert!(!kc.rekey_due(1000));
    }

    #[test]
    fn derived_key_lengths() {
        let p = default_provider();
        let d = Derive { provider: p.as_ref(), hash: HashAlg::Sha1, k: b"k", h: b"h", sess_id: b"s" };
        let a = d.key(b'A', 64);
        assert_eq!(a.len(), 64);
        let a2 = d.key(b'A', 16);
        assert_eq!(a[..16], a2[..]);
        assert_ne!(d.key(b'B', 16)[..], a2[..]);
    }
}
