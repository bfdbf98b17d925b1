//! Packet framing between the byte stream and decrypted payloads.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use pretty_hex::PrettyHex;
use zeroize::Zeroizing;

use crate::buffer::SshBuffer;
use crate::encrypt::{KeyState, Keys, SSH_PAYLOAD_START};
use crate::ident::{RemoteVersion, CR, LF};
use crate::packets::{Category, Packet, UserauthSuccess};
use crate::sshwire;

/// Incoming packets. Input may arrive in pieces of any size, a packet
/// is decrypted once complete and then held until `done_payload()`.
pub(crate) struct TrafIn {
    /// The current packet, ciphertext then decrypted in place
    buf: SshBuffer,
    /// Decompressed payload, when inbound compression is active
    inflated: Zeroizing<Vec<u8>>,
    state: RxState,
}

#[derive(Debug)]
enum RxState {
    /// Awaiting read, buffer is unused
    Idle,
    /// Reading the initial block for the packet length
    ReadInitial,
    /// Reading the remainder of the packet
    Read { expect: usize },
    /// Decrypted complete input payload
    InPayload { len: usize, seq: u32, inflated: bool },
}

impl TrafIn {
    pub fn new() -> Self {
        Self { buf: SshBuffer::new(), inflated: Zeroizing::new(Vec::new()), state: RxState::Idle }
    }

    pub fn ready_input(&self) -> bool {
        !matches!(self.state, RxState::InPayload { .. })
    }

    /// Returns the number of bytes consumed. Stops after a complete packet.
    pub fn input(
        &mut self,
        keys: &mut KeyState,
        remote_version: &mut RemoteVersion,
        buf: &[u8],
    ) -> Result<usize> {
        if !self.ready_input() {
            return Ok(0);
        }
        let mut inlen = 0;
        if remote_version.version().is_none() {
            inlen += remote_version.consume(buf)?;
            if remote_version.version().is_none() {
                return Ok(inlen);
            }
        }
        inlen += self.fill_input(keys, &buf[inlen..])?;
        Ok(inlen)
    }

    fn fill_input(&mut self, keys: &mut KeyState, buf: &[u8]) -> Result<usize> {
        let size_block = keys.size_block_dec();
        // 'r' is the remaining input, a slice that moves along.
        let mut r = buf;

        if matches!(self.state, RxState::Idle) && !r.is_empty() {
            self.buf.clear();
            self.state = RxState::ReadInitial;
        }

        if let RxState::ReadInitial = self.state {
            let need = (size_block - self.buf.len()).min(r.len());
            let x;
            (x, r) = r.split_at(need);
            self.buf.extend(x);

            // Have enough input now to decrypt the packet length
            if self.buf.len() == size_block {
                let expect = keys.decrypt_first_block(self.buf.as_mut_slice())?;
                self.buf.reserve(expect - size_block);
                self.state = RxState::Read { expect }
            }
        }

        if let RxState::Read { expect } = self.state {
            let need = (expect - self.buf.len()).min(r.len());
            let x;
            (x, r) = r.split_at(need);
            self.buf.extend(x);

            if self.buf.len() == expect {
                let seq = keys.recv_seq();
                let len = keys.decrypt(self.buf.as_mut_slice())?;
                let payload = &self.buf.as_slice()[SSH_PAYLOAD_START..][..len];
                let inflated = keys.inflate(payload, &mut self.inflated)?;
                self.state = RxState::InPayload { len, seq, inflated };
            }
        }

        Ok(buf.len() - r.len())
    }

    /// Returns the decrypted payload if ready, and the `seq` of that packet.
    pub fn payload(&self) -> Option<(&[u8], u32)> {
        match self.state {
            RxState::InPayload { inflated: true, seq, .. } => Some((self.inflated.as_slice(), seq)),
            RxState::InPayload { len, seq, .. } => {
                Some((&self.buf.as_slice()[SSH_PAYLOAD_START..][..len], seq))
            }
            _ => None,
        }
    }

    /// Called once the payload has been dispatched, scrubs it.
    pub fn done_payload(&mut self) {
        if let RxState::InPayload { .. } = self.state {
            self.buf.clear();
            self.inflated.clear();
            self.state = RxState::Idle;
        }
    }
}

/// Outgoing encrypted bytes.
///
/// While a key exchange is in progress, authentication and connection
/// packets are held and sent once the new keys are active.
pub(crate) struct TrafOut {
    buf: SshBuffer,
    held: VecDeque<Zeroizing<Vec<u8>>>,
    holding: bool,
    /// Delayed compression starts once this many held packets are sent
    compress_after: Option<usize>,
}

impl TrafOut {
    pub fn new() -> Self {
        Self { buf: SshBuffer::new(), held: VecDeque::new(), holding: false, compress_after: None }
    }

    /// Serializes and encrypts a packet to send
    pub fn send_packet(&mut self, p: Packet, keys: &mut KeyState) -> Result<()> {
        trace!("send_packet {:?}", p.message_num());
        let payload = Zeroizing::new(sshwire::write_ssh_vec(&p)?);

        let later = matches!(p.category(), Category::Auth | Category::Sess);
        if later && self.holding {
            trace!("Holding {:?} until kex completes", p.message_num());
            self.held.push_back(payload);
            return Ok(());
        }
        if later && keys.is_cleartext() {
            return Error::bug_msg("send cleartext");
        }
        trace!("Sending {p:?}");
        self.send_payload(&payload, keys)
    }

    /// Encrypts an already serialized payload
    pub fn send_payload(&mut self, payload: &[u8], keys: &mut KeyState) -> Result<()> {
        trace!("payload {:?}", payload.hex_dump());
        keys.encrypt_packet(payload, &mut self.buf)?;
        Ok(())
    }

    /// Queues our identification line, before any packet.
    pub fn send_version(&mut self, version: &str) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::bug());
        }
        self.buf.extend(version.as_bytes());
        self.buf.extend(&[CR, LF]);
        Ok(())
    }

    /// Holds non-kex packets until [`release`](Self::release)
    pub fn hold(&mut self) {
        self.holding = true;
    }

    /// Sends held packets with the current keys
    pub fn release(&mut self, keys: &mut KeyState) -> Result<()> {
        self.holding = false;
        if !self.held.is_empty() {
            trace!("Releasing {} held packets", self.held.len());
        }
        let mut sent = 0;
        while let Some(p) = self.held.pop_front() {
            self.send_payload(&p, keys)?;
            sent += 1;
            if self.compress_after == Some(sent) {
                self.compress_after = None;
                keys.enable_delayed_compression();
            }
        }
        Ok(())
    }

    /// Encrypted bytes ready for the transport
    pub fn pending(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Marks `n` bytes as written
    pub fn consume(&mut self, n: usize) {
        self.buf.consume(n)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Convenience to pass TrafOut with keys
pub(crate) struct TrafSend<'s> {
    out: &'s mut TrafOut,
    keys: &'s mut KeyState,
}

impl<'s> TrafSend<'s> {
    pub fn new(out: &'s mut TrafOut, keys: &'s mut KeyState) -> Self {
        Self { out, keys }
    }

    pub fn send<'p, P: Into<Packet<'p>>>(&mut self, p: P) -> Result<()> {
        self.out.send_packet(p.into(), self.keys)
    }

    pub fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.out.send_payload(payload, self.keys)
    }

    /// Stores keys from a completed key exchange
    pub fn set_next_keys(&mut self, keys: Keys) {
        self.keys.set_next(keys)
    }

    /// After sending NEWKEYS. Held packets are sent under the new keys.
    pub fn activate_enc(&mut self) -> Result<()> {
        self.keys.activate_enc()?;
        self.out.release(self.keys)
    }

    /// After receiving NEWKEYS
    pub fn activate_dec(&mut self) -> Result<()> {
        self.keys.activate_dec()
    }

    pub fn hold(&mut self) {
        self.out.hold()
    }

    pub fn enable_delayed_compression(&mut self) {
        self.keys.enable_delayed_compression()
    }

    /// Sends USERAUTH_SUCCESS. `zlib@openssh.com` starts after it has been
    /// encrypted, which is delayed when held for a key exchange.
    pub fn send_userauth_success(&mut self) -> Result<()> {
        self.out.send_packet(UserauthSuccess {}.into(), self.keys)?;
        if self.out.holding {
            self.out.compress_after = Some(self.out.held.len());
        } else {
            self.keys.enable_delayed_compression()
        }
        Ok(())
    }

    pub fn rekey_due(&self, limit: u64) -> bool {
        self.keys.rekey_due(limit)
    }
}

#[cfg(test)]
mod tests {
    use crate::compress::CompressMode;
    use crate::encrypt::tests::{algo_combos, keyed_pair};
    use crate::encrypt::DirAlgos;
    use crate::ident::RemoteVersion;
    use crate::packets::*;
    use crate::sshlog::init_test_log;
    use crate::sshnames::*;
    use crate::sshwire::{packet_from_bytes, BinString};
    use crate::traffic::*;

    fn ignore(data: &[u8]) -> Packet<'_> {
        Ignore { data: BinString(data) }.into()
    }

    /// Reads all complete packets from `wire`, `step` bytes at a time
    fn read_all(
        tin: &mut TrafIn,
        keys: &mut KeyState,
        rv: &mut RemoteVersion,
        wire: &[u8],
        step: usize,
    ) -> Vec<Vec<u8>> {
        let mut out = vec![];
        let mut w = wire;
        while !w.is_empty() {
            let chunk = &w[..step.min(w.len())];
            let l = tin.input(keys, rv, chunk).unwrap();
            w = &w[l..];
            if let Some((p, _seq)) = tin.payload() {
                out.push(p.to_vec());
                tin.done_payload();
            }
        }
        out
    }

    #[test]
    fn resumable_input() {
        init_test_log();
        for algos in algo_combos() {
            for step in [1, 3, 17, 1000] {
                let (mut ke, mut kd) = keyed_pair(&algos);
                let mut out = TrafOut::new();
                out.send_version("SSH-2.0-traffic").unwrap();
                let big = vec![0x55u8; 3000];
                for d in [&b"one"[..], b"", &big] {
                    out.send_packet(ignore(d), &mut ke).unwrap();
                }
                let wire = out.pending().to_vec();
                out.consume(wire.len());
                assert!(out.is_empty());

                let mut tin = TrafIn::new();
                let mut rv = RemoteVersion::new(true);
                let got = read_all(&mut tin, &mut kd, &mut rv, &wire, step);
                assert_eq!(rv.version(), Some("SSH-2.0-traffic"));
                assert_eq!(got.len(), 3);
                let ctx = ParseContext::default();
                match packet_from_bytes(&got[2], &ctx).unwrap() {
                    Packet::Ignore(i) => assert_eq!(i.data.0, big.as_slice()),
                    p => panic!("{p:?}"),
                }
            }
        }
    }

    #[test]
    fn payload_blocks_input() {
        let algos = algo_combos().remove(0);
        let (mut ke, mut kd) = keyed_pair(&algos);
        let mut out = TrafOut::new();
        out.send_version("SSH-2.0-x").unwrap();
        out.send_packet(ignore(b"a"), &mut ke).unwrap();
        out.send_packet(ignore(b"b"), &mut ke).unwrap();
        let wire = out.pending().to_vec();

        let mut tin = TrafIn::new();
        let mut rv = RemoteVersion::new(true);
        let l = tin.input(&mut kd, &mut rv, &wire).unwrap();
        assert!(l < wire.len());
        let (_, seq) = tin.payload().unwrap();
        assert_eq!(seq, 0);
        // nothing more is taken until the payload is done
        assert_eq!(tin.input(&mut kd, &mut rv, &wire[l..]).unwrap(), 0);
        tin.done_payload();
        let l2 = tin.input(&mut kd, &mut rv, &wire[l..]).unwrap();
        assert_eq!(l + l2, wire.len());
        assert_eq!(tin.payload().unwrap().1, 1);
    }

    #[test]
    fn hold_during_kex() {
        init_test_log();
        let algos = algo_combos().remove(0);
        let (mut ke, mut kd) = keyed_pair(&algos);
        let mut out = TrafOut::new();

        out.hold();
        out.send_packet(ServiceRequest { name: "ssh-userauth" }.into(), &mut ke).unwrap();
        assert!(out.is_empty());
        // transport messages still go out
        out.send_packet(ignore(b"x"), &mut ke).unwrap();
        let first = out.pending().len();
        assert!(first > 0);

        out.release(&mut ke).unwrap();
        assert!(out.pending().len() > first);

        let wire = out.pending().to_vec();
        let mut tin = TrafIn::new();
        let mut rv = RemoteVersion::new(true);
        rv.consume(b"SSH-2.0-x\r\n").unwrap();
        let got = read_all(&mut tin, &mut kd, &mut rv, &wire, 5);
        let ctx = ParseContext::default();
        assert!(matches!(packet_from_bytes(&got[0], &ctx).unwrap(), Packet::Ignore(_)));
        assert!(matches!(packet_from_bytes(&got[1], &ctx).unwrap(), Packet::ServiceRequest(_)));
    }

    #[test]
    fn success_held_before_compression() {
        init_test_log();
        let algos = DirAlgos {
            cipher: SSH_NAME_AES128_CTR,
            mac: Some(SSH_NAME_HMAC_SHA1),
            comp: CompressMode::ZlibDelayed,
        };
        let (mut ke, mut kd) = keyed_pair(&algos);
        let mut out = TrafOut::new();
        let big = vec![b'z'; 2000];

        out.hold();
        TrafSend::new(&mut out, &mut ke).send_userauth_success().unwrap();
        assert!(out.is_empty());
        // sent before compression starts
        out.send_packet(ignore(&big), &mut ke).unwrap();
        let plain_len = out.pending().len();
        out.release(&mut ke).unwrap();
        let mid = out.pending().len();
        out.send_packet(ignore(&big), &mut ke).unwrap();
        assert!(out.pending().len() - mid < plain_len / 4);

        let wire = out.pending().to_vec();
        let mut tin = TrafIn::new();
        let mut rv = RemoteVersion::new(true);
        rv.consume(b"SSH-2.0-x\r\n").unwrap();
        let mut wire = &wire[..];
        let mut got = vec![];
        while !wire.is_empty() {
            let l = tin.input(&mut kd, &mut rv, wire).unwrap();
            wire = &wire[l..];
            if let Some((p, _)) = tin.payload() {
                got.push(p.to_vec());
                tin.done_payload();
                // the peer starts decompressing after reading SUCCESS
                if got.len() == 2 {
                    kd.enable_delayed_compression();
                }
            }
        }
        assert_eq!(got.len(), 3);
        let ctx = ParseContext::default();
        assert!(matches!(packet_from_bytes(&got[0], &ctx).unwrap(), Packet::Ignore(_)));
        assert!(matches!(packet_from_bytes(&got[1], &ctx).unwrap(), Packet::UserauthSuccess(_)));
        match packet_from_bytes(&got[2], &ctx).unwrap() {
            Packet::Ignore(i) => assert_eq!(i.data.0, big.as_slice()),
            p => panic!("{p:?}"),
        }
    }

    #[test]
    fn corrupt_input_fails() {
        let algos = algo_combos().pop().unwrap();
        let (mut ke, mut kd) = keyed_pair(&algos);
        let mut out = TrafOut::new();
        out.send_packet(ignore(b"some data"), &mut ke).unwrap();
        let mut wire = out.pending().to_vec();
        let n = wire.len();
        wire[n - 1] ^= 1;

        let mut tin = TrafIn::new();
        let mut rv = RemoteVersion::new(true);
        rv.consume(b"SSH-2.0-x\r\n").unwrap();
        assert!(tin.input(&mut kd, &mut rv, &wire).is_err());
    }
}
