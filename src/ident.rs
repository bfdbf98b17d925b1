//! Identification string exchange, RFC4253 section 4.2.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use heapless::Vec;

use crate::config::{MAX_BANNER_LINE, MAX_PRE_BANNER_LINE, MAX_PRE_BANNER_LINES};

const SSH_PREFIX: &[u8] = b"SSH-";
/// Versions we speak. 1.99 is a server also offering SSH-1, which we ignore.
const VERSIONS: [&[u8]; 2] = [b"SSH-2.0-", b"SSH-1.99-"];

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;

/// Our identification line without the trailing CR LF, as hashed in the kex
pub(crate) fn our_version(software: &str) -> String {
    format!("SSH-2.0-{software}")
}

/// Parses and stores the remote SSH version string
pub(crate) struct RemoteVersion {
    /// Excludes the line ending
    storage: Vec<u8, MAX_BANNER_LINE>,
    st: VersPars,
    num_lines: usize,
    /// Servers only accept the identification on the first line
    allow_lines: bool,
}

/// Version parsing state.
/// We need to match
/// `SSH-protoversion-softwareversion SP comments CR LF`
/// at the start of a line. The server may first send other lines
/// which are discarded.
#[derive(Debug)]
enum VersPars {
    /// Reading start of a line, before receiving a full SSH- prefix
    Start,
    /// Have a line that didn't start with SSH-, discarding until LF
    Discarding { len: usize },
    /// Currently reading a SSH- string, waiting for ending CR
    FillSSH,
    /// Have ending CR after a version, Waiting for ending LF
    HaveCR,
    /// Completed string.
    Done,
}

impl RemoteVersion {
    pub fn new(is_client: bool) -> Self {
        RemoteVersion {
            storage: Vec::new(),
            st: VersPars::Start,
            num_lines: 0,
            allow_lines: is_client,
        }
    }

    /// Returns the parsed version if complete.
    pub fn version(&self) -> Option<&str> {
        match self.st {
            // checked as ascii when completed
            VersPars::Done => core::str::from_utf8(&self.storage).ok(),
            _ => None,
        }
    }

    /// Reads the initial SSH stream to find the version string and returns
    /// the number of bytes consumed. Stops at the end of the version line.
    pub fn consume(&mut self, buf: &[u8]) -> Result<usize> {
        let mut taken = 0;
        for &b in buf {
            if matches!(self.st, VersPars::Done) {
                break;
            }
            taken += 1;

            match self.st {
                VersPars::Start => {
                    self.push(b)?;
                    let s = self.storage.as_slice();
                    if s == SSH_PREFIX {
                        self.st = VersPars::FillSSH
                    } else if !SSH_PREFIX.starts_with(s) {
                        self.start_discard(b)?;
                    }
                }

                VersPars::Discarding { ref mut len } => {
                    *len += 1;
                    if b == 0 || *len > MAX_PRE_BANNER_LINE {
                        debug!("Bad line before SSH identification");
                        return Err(Error::NotSSH);
                    }
                    if b == LF {
                        self.st = VersPars::Start;
                    }
                }

                VersPars::FillSSH => match b {
                    CR => self.st = VersPars::HaveCR,
                    // Tolerate a bare LF, as OpenSSH does
                    LF => self.finish()?,
                    0 => return Err(Error::NotSSH),
                    _ => self.push(b)?,
                },

                VersPars::HaveCR => match b {
                    LF => self.finish()?,
                    _ => {
                        debug!("CR without LF in SSH identification");
                        return Err(Error::NotSSH);
                    }
                },

                VersPars::Done => (),
            }
        }
        Ok(taken)
    }

    fn push(&mut self, b: u8) -> Result<()> {
        // room for CR LF
        if self.storage.len() + 2 >= MAX_BANNER_LINE {
            debug!("SSH identification too long");
            return Err(Error::NotSSH);
        }
        self.storage.push(b).map_err(|_| Error::NotSSH)
    }

    fn start_discard(&mut self, b: u8) -> Result<()> {
        if !self.allow_lines {
            debug!("Client didn't start with SSH identification");
            return Err(Error::NotSSH);
        }
        self.num_lines += 1;
        if self.num_lines > MAX_PRE_BANNER_LINES {
            debug!("Too many lines before SSH identification");
            return Err(Error::NotSSH);
        }
        let len = self.storage.len();
        self.storage.clear();
        self.st = if b == LF { VersPars::Start } else { VersPars::Discarding { len } };
        if b == 0 {
            return Err(Error::NotSSH);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let s = self.storage.as_slice();
        if !s.is_ascii() {
            return Err(Error::NotSSH);
        }
        let rest = &s[SSH_PREFIX.len()..];
        if !rest.contains(&b'-') {
            // Not SSH-protoversion-softwareversion, treat it as another
            // line preceding the identification
            return self.skip_line();
        }
        if !VERSIONS.iter().any(|v| s.starts_with(v)) {
            let version = rest
                .split(|c| *c == b'-')
                .next()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            info!("Remote SSH version {version} isn't supported");
            return Err(Error::ProtocolVersion { version });
        }
        self.st = VersPars::Done;
        Ok(())
    }

    fn skip_line(&mut self) -> Result<()> {
        if !self.allow_lines {
            debug!("Client didn't start with SSH identification");
            return Err(Error::NotSSH);
        }
        self.num_lines += 1;
        if self.num_lines > MAX_PRE_BANNER_LINES {
            debug!("Too many lines before SSH identification");
            return Err(Error::NotSSH);
        }
        self.storage.clear();
        self.st = VersPars::Start;
        Ok(())
    }
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use crate::ident::*;
    use crate::sshlog::init_test_log;

    fn test_version(v: &str, split: usize, expect: &str) -> Result<usize> {
        let mut r = RemoteVersion::new(true);

        let split = split.min(v.len());
        let (a, b) = v.as_bytes().split_at(split);

        let taken1 = r.consume(a)?;
        let done1 = r.version().is_some();
        let taken2 = r.consume(b)?;

        if done1 {
            assert_eq!(taken2, 0);
        }
        if taken2 > 0 {
            assert_eq!(taken1, a.len());
        }

        let v = r.version().ok_or(Error::NotSSH)?;
        assert_eq!(v, expect);
        Ok(taken1 + taken2)
    }

    #[test]
    fn version() {
        init_test_log();
        let long = "<".repeat(300);
        let ok_long = "<".repeat(250);
        // split input at various positions
        let splits = [
            (0..40).collect(),
            vec![120, 126, 127, 128, 252, 253, 254, 255, 256],
        ].concat();
        for &i in splits.iter() {
            test_version("SSH-2.0-@\x0d\x0a", i, "SSH-2.0-@").unwrap();
            test_version("SSH-2.0-good something SSH-2.0-trick\x0d\x0azzz", i, "SSH-2.0-good something SSH-2.0-trick").unwrap();
            test_version("SSH-2.0-@\x0d\x0d", i, "").unwrap_err();
            test_version("bleh \x0d\x0aSSH-2.0-@\x0d\x0a", i, "SSH-2.0-@").unwrap();
            assert_eq!(test_version("SSH-2.0-@\x0d\x0amore", i, "SSH-2.0-@").unwrap(), 11);
            assert_eq!(test_version("\x0d\x0aSSH-2.0-@\x0d\x0amore", i, "SSH-2.0-@").unwrap(), 13);
            test_version("\x0d\x0aSSH-2.0bleh \x0d\x0aSSH-2.0-@\x0d\x0a", i, "SSH-2.0-@").unwrap();
            test_version("SSH-1.99-old\x0d\x0a", i, "SSH-1.99-old").unwrap();
            test_version("SSH-2.0-lf\x0a", i, "SSH-2.0-lf").unwrap();
            test_version("SSH-\x0d\x0aSSH-2.0-@\x0d\x0a", i, "SSH-2.0-@").unwrap();
            test_version("SSH-1.5-old\x0d\x0aSSH-2.0-@\x0d\x0a", i, "").unwrap_err();

            test_version(&long, i, "").unwrap_err();
            test_version(&format!("{ok_long}\x0d\x0aSSH-2.0-works\x0d\x0a"), i, "SSH-2.0-works").unwrap();
            test_version(&format!("{long}\x0d\x0aSSH-2.0-works\x0d\x0a"), i, "").unwrap_err();
            test_version(&format!("SSH-2.0-{}\x0d\x0a", "x".repeat(130)), i, "").unwrap_err();
        }
    }

    #[test]
    fn old_protocol() {
        let mut r = RemoteVersion::new(true);
        match r.consume(b"SSH-1.5-ancient\r\n") {
            Err(Error::ProtocolVersion { version }) => assert_eq!(version, "1.5"),
            e => panic!("{e:?}"),
        }
    }

    #[test]
    fn ssh_line_without_version() {
        init_test_log();
        let mut r = RemoteVersion::new(true);
        r.consume(b"SSH-2.0bleh \r\nSSH-2.0-ok\r\n").unwrap();
        assert_eq!(r.version(), Some("SSH-2.0-ok"));

        let mut r = RemoteVersion::new(false);
        assert!(matches!(r.consume(b"SSH-2.0bleh \r\n"), Err(Error::NotSSH)));
    }

    #[test]
    fn line_limits() {
        let mut r = RemoteVersion::new(true);
        let lines = "hello\r\n".repeat(MAX_PRE_BANNER_LINES);
        r.consume(lines.as_bytes()).unwrap();
        assert!(r.consume(b"one too many\r\n").is_err());

        let mut r = RemoteVersion::new(true);
        assert!(r.consume(b"nul \0 here\r\nSSH-2.0-x\r\n").is_err());
    }

    #[test]
    fn server_wants_first_line() {
        let mut r = RemoteVersion::new(false);
        assert!(r.consume(b"hello\r\nSSH-2.0-x\r\n").is_err());
        let mut r = RemoteVersion::new(false);
        r.consume(b"SSH-2.0-x\r\n").unwrap();
        assert_eq!(r.version(), Some("SSH-2.0-x"));
    }
}
