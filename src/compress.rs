//! Payload compression, `zlib` and `zlib@openssh.com`.
//!
//! Each direction is one continuous zlib stream, every packet ends
//! with a partial flush.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::config::MAX_PACKET_LEN;
use crate::sshnames::*;

pub const NAMES: &[&str] = &[SSH_NAME_NONE, SSH_NAME_ZLIB_OPENSSH, SSH_NAME_ZLIB];

pub fn supported(name: &str) -> bool {
    NAMES.contains(&name)
}

/// A negotiated compression method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    None,
    /// Active from NEWKEYS
    Zlib,
    /// Active once user authentication succeeds
    ZlibDelayed,
}

impl CompressMode {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            SSH_NAME_NONE => Ok(Self::None),
            SSH_NAME_ZLIB => Ok(Self::Zlib),
            SSH_NAME_ZLIB_OPENSSH => Ok(Self::ZlibDelayed),
            _ => Err(Error::UnknownMethod { kind: "compression" }),
        }
    }

    /// Whether compression runs immediately after NEWKEYS
    pub fn active_at_newkeys(&self, authenticated: bool) -> bool {
        match self {
            Self::None => false,
            Self::Zlib => true,
            Self::ZlibDelayed => authenticated,
        }
    }
}

pub struct Compressor(Compress);

impl Compressor {
    pub fn new() -> Self {
        Self(Compress::new(Compression::fast(), true))
    }

    /// Compresses `input` to `out`, replacing its contents.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.reserve(input.len() + 64);
        let start = self.0.total_in();
        loop {
            let used = (self.0.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            self.0
                .compress_vec(&input[used..], out, FlushCompress::Partial)
                .map_err(|e| {
                    debug!("Compression failed: {e}");
                    Error::Compression
                })?;
            // Flushing is complete once all input is used and output wasn't full
            let used = (self.0.total_in() - start) as usize;
            if used == input.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(())
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Decompressor(Decompress);

impl Decompressor {
    pub fn new() -> Self {
        Self(Decompress::new(true))
    }

    /// Decompresses `input` to `out`, replacing its contents.
    ///
    /// Output larger than the maximum packet size fails.
    pub fn decompress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.reserve((input.len() * 4).clamp(256, MAX_PACKET_LEN));
        let start = self.0.total_in();
        loop {
            let used = (self.0.total_in() - start) as usize;
            if out.len() == out.capacity() {
                if out.len() >= MAX_PACKET_LEN {
                    debug!("Decompressed packet too large");
                    return Err(Error::Compression);
                }
                out.reserve(out.capacity().min(MAX_PACKET_LEN - out.len()));
            }
            let (in0, out0) = (self.0.total_in(), self.0.total_out());
            self.0
                .decompress_vec(&input[used..], out, FlushDecompress::Sync)
                .map_err(|e| {
                    debug!("Decompression failed: {e}");
                    Error::Compression
                })?;
            let used = (self.0.total_in() - start) as usize;
            if used == input.len() && out.len() < out.capacity() {
                break;
            }
            if self.0.total_in() == in0 && self.0.total_out() == out0 {
                debug!("Decompression stalled");
                return Err(Error::Compression);
            }
        }
        if out.len() > MAX_PACKET_LEN {
            debug!("Decompressed packet too large");
            return Err(Error::Compression);
        }
        Ok(())
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::compress::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn stream_roundtrip() {
        init_test_log();
        let mut c = Compressor::new();
        let mut d = Decompressor::new();
        let mut z = Vec::new();
        let mut out = Vec::new();
        let packets: Vec<Vec<u8>> = vec![
            b"first packet".to_vec(),
            vec![],
            b"first packet".to_vec(),
            (0..5000u32).map(|i| (i % 251) as u8).collect(),
        ];
        for p in packets.iter() {
            c.compress(p, &mut z).unwrap();
            d.decompress(&z, &mut out).unwrap();
            assert_eq!(&out, p);
        }
    }

    #[test]
    fn repeated_data_shrinks() {
        let mut c = Compressor::new();
        let mut z = Vec::new();
        let p = vec![b'a'; 10000];
        c.compress(&p, &mut z).unwrap();
        assert!(z.len() < 200);
    }

    #[test]
    fn oversize_rejected() {
        init_test_log();
        let mut c = Compressor::new();
        let mut d = Decompressor::new();
        let mut z = Vec::new();
        let mut out = Vec::new();
        let p = vec![0u8; MAX_PACKET_LEN + 1000];
        c.compress(&p, &mut z).unwrap();
        assert!(matches!(d.decompress(&z, &mut out), Err(Error::Compression)));
    }

    #[test]
    fn garbage_rejected() {
        let mut d = Decompressor::new();
        let mut out = Vec::new();
        assert!(d.decompress(b"\xff\xff\xff\xff not zlib", &mut out).is_err());
    }

    #[test]
    fn modes() {
        assert_eq!(CompressMode::from_name("zlib").unwrap(), CompressMode::Zlib);
        assert!(!CompressMode::ZlibDelayed.active_at_newkeys(false));
        assert!(CompressMode::ZlibDelayed.active_at_newkeys(true));
        assert!(CompressMode::from_name("lz4").is_err());
    }
}
