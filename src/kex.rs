//! Algorithm negotiation and key exchange, RFC4253 sections 7 and 8.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use digest::DynDigest;
use pretty_hex::PrettyHex;
use zeroize::Zeroizing;

use crate::client::ClientHandler;
use crate::compress::CompressMode;
use crate::config::SshConfig;
use crate::crypto::{CryptoProvider, HashAlg, SshKex};
use crate::encrypt::{DirAlgos, Keys};
use crate::namelist::{LocalNames, NameList};
use crate::packets::{self, Packet};
use crate::sign::SignKey;
use crate::sshwire::{self, hash_mpint, BinString};
use crate::traffic::TrafSend;

/// Large enough for a SHA512 exchange hash
const MAX_SESSID: usize = 64;
pub type SessId = heapless::Vec<u8, MAX_SESSID>;

static EMPTY_NAMES: LocalNames = LocalNames::new();

/// Our algorithm lists as sent in KEXINIT
#[derive(Debug, Clone)]
pub(crate) struct AlgoConfig {
    kexs: LocalNames,
    hostsig: LocalNames,
    ciphers: LocalNames,
    macs: LocalNames,
    comps: LocalNames,
}

impl AlgoConfig {
    /// A server only offers signature algorithms its host keys can make.
    pub fn new(conf: &SshConfig, hostkeys: Option<&[Box<dyn SignKey>]>) -> Result<Self> {
        let mut hostsig = conf.hostkey.clone();
        if let Some(keys) = hostkeys {
            hostsig.retain(|n| keys.iter().any(|k| k.sig_algorithms().contains(n)));
            if hostsig.is_empty() {
                return Err(Error::BadUsage { msg: "no usable host key" });
            }
        }
        Ok(Self {
            kexs: LocalNames(conf.kex.clone()),
            hostsig: LocalNames(hostsig),
            ciphers: LocalNames(conf.ciphers.clone()),
            macs: LocalNames(conf.macs.clone()),
            comps: LocalNames(conf.compression.clone()),
        })
    }
}

/// Algorithms chosen by a key exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: &'static str,
    /// Host key signature algorithm
    pub hostkey: &'static str,
    pub cipher_c2s: &'static str,
    pub cipher_s2c: &'static str,
    /// `None` with an AEAD cipher
    pub mac_c2s: Option<&'static str>,
    pub mac_s2c: Option<&'static str>,
    pub comp_c2s: &'static str,
    pub comp_s2c: &'static str,
}

impl fmt::Display for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kex {} hostkey {} cipher {}/{} mac {}/{} comp {}/{}",
            self.kex,
            self.hostkey,
            self.cipher_c2s,
            self.cipher_s2c,
            self.mac_c2s.unwrap_or("-"),
            self.mac_s2c.unwrap_or("-"),
            self.comp_c2s,
            self.comp_s2c
        )
    }
}

/// Records the chosen algorithms while key exchange proceeds
#[derive(Debug)]
pub(crate) struct Algos {
    pub negotiated: Negotiated,
    pub enc: DirAlgos,
    pub dec: DirAlgos,

    // If first_kex_packet_follows was set in SSH_MSG_KEXINIT but the
    // guessed algorithms don't match, we discard the next message (RFC4253 Sec 7).
    pub discard_next: bool,

    pub is_client: bool,
}

/// The current state of the Kex
pub(crate) enum Kex {
    /// No key exchange in progress
    Idle,

    /// Have sent our KexInit, waiting for the peer's.
    KexInit {
        /// Our KEXINIT payload, for the exchange hash
        our_kexinit: Vec<u8>,
    },

    /// Waiting for KexDHInit (server) or KexDHReply (client)
    KexDH { algos: Algos, kex_hash: KexHash, kex: Box<dyn SshKex> },

    /// Have sent our NewKeys, waiting for the peer's.
    NewKeys { algos: Algos },

    /// A transient state use internally to transition between other states.
    Taken,
}

impl fmt::Debug for Kex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kex::Idle => "Idle",
            Kex::KexInit { .. } => "KexInit",
            Kex::KexDH { .. } => "KexDH",
            Kex::NewKeys { .. } => "NewKeys",
            Kex::Taken => "Taken",
        };
        f.write_str(s)
    }
}

/// Progressively hashes the version idents, kexinit payloads,
/// host key, exchange values and shared secret.
pub(crate) struct KexHash {
    hc: Box<dyn DynDigest + Send>,
}

impl KexHash {
    fn new(
        provider: &dyn CryptoProvider,
        alg: HashAlg,
        is_client: bool,
        our_version: &str,
        remote_version: &str,
        our_kexinit: &[u8],
        remote_kexinit: &[u8],
    ) -> Self {
        // RFC4253 section 8:
        // The hash H is computed as the HASH hash of the concatenation of the
        // following:
        //    string    V_C, the client's identification string (CR and LF
        //              excluded)
        //    string    V_S, the server's identification string (CR and LF
        //              excluded)
        //    string    I_C, the payload of the client's SSH_MSG_KEXINIT
        //    string    I_S, the payload of the server's SSH_MSG_KEXINIT
        //    string    K_S, the host key
        //    mpint     e, exchange value sent by the client (aka q_c)
        //    mpint     f, exchange value sent by the server (aka q_s)
        //    mpint     K, the shared secret
        let mut kh = KexHash { hc: provider.hasher(alg) };
        if is_client {
            kh.hash_slice(our_version.as_bytes());
            kh.hash_slice(remote_version.as_bytes());
            kh.hash_slice(our_kexinit);
            kh.hash_slice(remote_kexinit);
        } else {
            kh.hash_slice(remote_version.as_bytes());
            kh.hash_slice(our_version.as_bytes());
            kh.hash_slice(remote_kexinit);
            kh.hash_slice(our_kexinit);
        }
        kh
    }

    /// Fill everything except K.
    ///
    /// Finite field values are already mpint bodies, so hash the same as strings.
    fn prefinish(&mut self, host_key: &[u8], q_c: &[u8], q_s: &[u8]) {
        self.hash_slice(host_key);
        self.hash_slice(q_c);
        self.hash_slice(q_s);
    }

    /// Compute the remainder of the hash, consuming KexHash
    fn finish(mut self, k: &[u8]) -> Result<SessId> {
        hash_mpint(self.hc.as_mut(), k);
        SessId::from_slice(&self.hc.finalize()).trap()
    }

    // Hashes a slice, with added u32 length prefix.
    fn hash_slice(&mut self, v: &[u8]) {
        self.hc.update(&(v.len() as u32).to_be_bytes());
        self.hc.update(v);
    }
}

impl Kex {
    pub fn new() -> Self {
        Kex::Idle
    }

    fn take(&mut self) -> Self {
        debug_assert!(!matches!(self, Kex::Taken));
        core::mem::replace(self, Kex::Taken)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Kex::Idle)
    }

    pub fn sent_kexinit(&self) -> bool {
        !matches!(self, Kex::Idle)
    }

    /// Sends a `KexInit` message. Must be called from `Idle` state.
    ///
    /// Non-kex packets are held until our NEWKEYS.
    pub fn send_kexinit(
        &mut self,
        conf: &AlgoConfig,
        provider: &dyn CryptoProvider,
        s: &mut TrafSend,
    ) -> Result<()> {
        if !self.is_idle() {
            return Err(Error::bug());
        }
        let mut cookie = [0u8; 16];
        provider.fill_random(&mut cookie)?;
        let p = Self::make_kexinit(cookie, conf);
        let our_kexinit = sshwire::write_ssh_vec(&p)?;
        debug!("Sending KEXINIT");
        s.hold();
        s.send_payload(&our_kexinit)?;
        *self = Kex::KexInit { our_kexinit };
        Ok(())
    }

    fn make_kexinit(cookie: [u8; 16], conf: &AlgoConfig) -> Packet<'_> {
        packets::KexInit {
            cookie,
            kex: (&conf.kexs).into(),
            hostsig: (&conf.hostsig).into(),
            cipher_c2s: (&conf.ciphers).into(),
            cipher_s2c: (&conf.ciphers).into(),
            mac_c2s: (&conf.macs).into(),
            mac_s2c: (&conf.macs).into(),
            comp_c2s: (&conf.comps).into(),
            comp_s2c: (&conf.comps).into(),
            lang_c2s: (&EMPTY_NAMES).into(),
            lang_s2c: (&EMPTY_NAMES).into(),
            first_follows: false,
            reserved: 0,
        }
        .into()
    }

    /// Handles the peer's KEXINIT, replying with ours if not already sent.
    ///
    /// `remote_payload` is the raw packet payload, for the exchange hash.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_kexinit(
        &mut self,
        remote_kexinit: &packets::KexInit,
        remote_payload: &[u8],
        is_client: bool,
        conf: &AlgoConfig,
        provider: &dyn CryptoProvider,
        our_version: &str,
        remote_version: &str,
        s: &mut TrafSend,
    ) -> Result<()> {
        // Reply if we haven't already sent one. This will bump the state to Kex::KexInit
        if self.is_idle() {
            self.send_kexinit(conf, provider, s)?;
        }

        let Kex::KexInit { our_kexinit } = self.take() else {
            debug!("Unexpected KEXINIT");
            return Err(Error::PacketWrong);
        };

        let algos = Self::algo_negotiation(is_client, remote_kexinit, conf, provider)?;
        debug!("Negotiated {}", algos.negotiated);

        let kex = provider.new_kex(algos.negotiated.kex)?;
        if is_client {
            s.send(packets::KexDHInit { q_c: BinString(kex.public()) })?;
        }
        let kex_hash = KexHash::new(
            provider,
            kex.hash_alg(),
            is_client,
            our_version,
            remote_version,
            &our_kexinit,
            remote_payload,
        );
        *self = Kex::KexDH { algos, kex_hash, kex };
        Ok(())
    }

    /// Returns `true` if the packet should be discarded, following a wrong guess
    fn discard_guess(&mut self) -> bool {
        if let Kex::KexDH { algos, .. } = self {
            if algos.discard_next {
                debug!("Discarding wrongly guessed kex packet");
                algos.discard_next = false;
                return true;
            }
        }
        false
    }

    /// Server side. Replies with the signed exchange hash and NEWKEYS.
    pub fn handle_kexdhinit(
        &mut self,
        p: &packets::KexDHInit,
        hostkeys: &[Box<dyn SignKey>],
        provider: &dyn CryptoProvider,
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        if self.discard_guess() {
            return Ok(());
        }
        let Kex::KexDH { algos, mut kex_hash, kex } = self.take() else {
            debug!("Unexpected KEXDH_INIT");
            return Err(Error::PacketWrong);
        };
        if algos.is_client {
            return Err(Error::PacketWrong);
        }

        let sig_algo = algos.negotiated.hostkey;
        let hostkey = hostkeys
            .iter()
            .find(|k| k.sig_algorithms().contains(&sig_algo))
            .trap_msg(format_args!("No hostkey for {sig_algo}"))?;
        let k_s = hostkey.public_blob();

        let q_s = kex.public().to_vec();
        let hash_alg = kex.hash_alg();
        let k = kex.agree(p.q_c.0)?;
        kex_hash.prefinish(&k_s, p.q_c.0, &q_s);
        let h = kex_hash.finish(&k)?;
        trace!("sign kexreply h {:?}", h.hex_dump());

        let sig = hostkey.sign(sig_algo, &h)?;
        s.send(packets::KexDHReply { k_s: BinString(&k_s), q_s: BinString(&q_s), sig: BinString(&sig) })?;

        Self::new_keys(&algos, provider, hash_alg, &k, &h, sess_id, s)?;
        *self = Kex::NewKeys { algos };
        Ok(())
    }

    /// Client side. Verifies the server's signature and host key, then sends NEWKEYS.
    pub fn handle_kexdhreply(
        &mut self,
        p: &packets::KexDHReply,
        provider: &dyn CryptoProvider,
        handler: &mut dyn ClientHandler,
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        if self.discard_guess() {
            return Ok(());
        }
        let Kex::KexDH { algos, mut kex_hash, kex } = self.take() else {
            debug!("Unexpected KEXDH_REPLY");
            return Err(Error::PacketWrong);
        };
        if !algos.is_client {
            return Err(Error::PacketWrong);
        }

        let q_c = kex.public().to_vec();
        let hash_alg = kex.hash_alg();
        let k = kex.agree(p.q_s.0)?;
        kex_hash.prefinish(p.k_s.0, &q_c, p.q_s.0);
        let h = kex_hash.finish(&k)?;

        trace!("verify h {:?}", h.hex_dump());
        provider.verify(algos.negotiated.hostkey, p.k_s.0, &h, p.sig.0).map_err(|e| {
            info!("Host key signature failed: {e}");
            Error::BadSig
        })?;
        debug!("Hostkey signature is valid");
        if !handler.check_hostkey(p.k_s.0) {
            info!("Host key rejected");
            return Err(Error::HostKeyRejected);
        }

        Self::new_keys(&algos, provider, hash_alg, &k, &h, sess_id, s)?;
        *self = Kex::NewKeys { algos };
        Ok(())
    }

    /// Derives keys, sends NEWKEYS and switches outbound keys.
    fn new_keys(
        algos: &Algos,
        provider: &dyn CryptoProvider,
        hash: HashAlg,
        k: &Zeroizing<Vec<u8>>,
        h: &SessId,
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        // The first KEX's H becomes the persistent sess_id
        let sess_id = sess_id.get_or_insert_with(|| h.clone());
        let keys = Keys::derive(provider, hash, k, h, sess_id, algos.is_client, &algos.enc, &algos.dec)?;
        s.set_next_keys(keys);
        s.send(packets::NewKeys {})?;
        s.activate_enc()
    }

    /// The peer's NEWKEYS, switches inbound keys. Returns the negotiated algorithms.
    pub fn handle_newkeys(&mut self, s: &mut TrafSend) -> Result<Negotiated> {
        let Kex::NewKeys { algos } = self.take() else {
            debug!("Unexpected NEWKEYS");
            return Err(Error::PacketWrong);
        };
        s.activate_dec()?;
        *self = Kex::Idle;
        Ok(algos.negotiated)
    }

    /// Perform SSH algorithm negotiation
    fn algo_negotiation(
        is_client: bool,
        p: &packets::KexInit,
        conf: &AlgoConfig,
        provider: &dyn CryptoProvider,
    ) -> Result<Algos> {
        // For each algorithm we select the first name in the client's
        // list that is also present in the server's list.
        let kex = p.kex.first_match(is_client, &conf.kexs)?.ok_or(Error::AlgoNoMatch { algo: "kex" })?;
        let hostkey = p
            .hostsig
            .first_match(is_client, &conf.hostsig)?
            .ok_or(Error::AlgoNoMatch { algo: "hostkey" })?;

        let goodguess = p.kex.first() == kex && p.hostsig.first() == hostkey;
        let discard_next = p.first_follows && !goodguess;

        let cipher = |l: &NameList| -> Result<&'static str> {
            l.first_match(is_client, &conf.ciphers)?.ok_or(Error::AlgoNoMatch { algo: "cipher" })
        };
        let cipher_c2s = cipher(&p.cipher_c2s)?;
        let cipher_s2c = cipher(&p.cipher_s2c)?;

        // We ignore mac algorithms for AEAD ciphers
        let mac = |c: &str, l: &NameList| -> Result<Option<&'static str>> {
            if provider.cipher_info(c)?.aead {
                return Ok(None);
            }
            l.first_match(is_client, &conf.macs)?.ok_or(Error::AlgoNoMatch { algo: "mac" }).map(Some)
        };
        let mac_c2s = mac(cipher_c2s, &p.mac_c2s)?;
        let mac_s2c = mac(cipher_s2c, &p.mac_s2c)?;

        let comp = |l: &NameList| -> Result<&'static str> {
            l.first_match(is_client, &conf.comps)?.ok_or(Error::AlgoNoMatch { algo: "compression" })
        };
        let comp_c2s = comp(&p.comp_c2s)?;
        let comp_s2c = comp(&p.comp_s2c)?;

        // Ignore language fields

        let c2s =
            DirAlgos { cipher: cipher_c2s, mac: mac_c2s, comp: CompressMode::from_name(comp_c2s)? };
        let s2c =
            DirAlgos { cipher: cipher_s2c, mac: mac_s2c, comp: CompressMode::from_name(comp_s2c)? };
        let (enc, dec) = if is_client { (c2s, s2c) } else { (s2c, c2s) };

        Ok(Algos {
            negotiated: Negotiated {
                kex,
                hostkey,
                cipher_c2s,
                cipher_s2c,
                mac_c2s,
                mac_s2c,
                comp_c2s,
                comp_s2c,
            },
            enc,
            dec,
            discard_next,
            is_client,
        })
    }
}
