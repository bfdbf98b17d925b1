//! SSH comma separated algorithm lists.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use ascii::{AsciiChar::Comma, AsciiStr};

use crate::sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireResult, try_as_ascii};

// Used for lists of:
// - algorithm names
// - key types
// - signature types
// - auth types

/// A comma separated string, can be decoded or encoded.
/// Used for remote name lists.
///
/// Wire format is described in [RFC4251](https://tools.ietf.org/html/rfc4251) SSH Architecture "name-list"
#[derive(Debug, Clone, Copy)]
pub struct StringNames<'a>(pub &'a AsciiStr);

/// A list of names, can only be encoded. Used for local name lists,
/// taken from [`SshConfig`](crate::SshConfig) preferences.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LocalNames(pub Vec<&'static str>);

/// The general form that can store either representation
#[derive(Debug, Clone)]
pub enum NameList<'a> {
    String(StringNames<'a>),
    Local(&'a LocalNames),
}

impl SSHEncode for StringNames<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for StringNames<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let len = u32::dec(s)? as usize;
        Ok(StringNames(try_as_ascii(s.take(len)?)?))
    }
}

impl SSHEncode for NameList<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            NameList::String(n) => n.enc(s),
            NameList::Local(n) => n.enc(s),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for NameList<'a> {
    fn dec<S>(s: &mut S) -> WireResult<NameList<'a>>
    where
        S: SSHSource<'de>,
    {
        Ok(NameList::String(StringNames::dec(s)?))
    }
}

/// Serialize the list of names with comma separators
impl SSHEncode for &LocalNames {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let names = self.0.as_slice();
        // space for names and commas
        let strlen = names.iter().map(|n| n.len()).sum::<usize>()
            + names.len().saturating_sub(1);
        (strlen as u32).enc(s)?;
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                b','.enc(s)?;
            }
            n.as_bytes().enc(s)?;
        }
        Ok(())
    }
}

impl<'a> TryFrom<&'a str> for StringNames<'a> {
    type Error = ();
    fn try_from(s: &'a str) -> Result<Self, Self::Error> {
        Ok(Self(AsciiStr::from_ascii(s).map_err(|_| ())?))
    }
}

impl<'a> TryFrom<&'a str> for NameList<'a> {
    type Error = ();
    fn try_from(s: &'a str) -> Result<Self, Self::Error> {
        Ok(NameList::String(s.try_into()?))
    }
}

impl From<&[&'static str]> for LocalNames {
    fn from(s: &[&'static str]) -> Self {
        Self(s.to_vec())
    }
}

impl<'a> From<&'a LocalNames> for NameList<'a> {
    fn from(s: &'a LocalNames) -> Self {
        NameList::Local(s)
    }
}

impl<'a> NameList<'a> {
    /// Returns the first name in this namelist that matches, based on SSH priority.
    ///
    /// The SSH client's list (which could be either remote or ours) is used
    /// to determine priority.
    /// `self` is a remote list, `our_options` are our own allowed options in preference
    /// order.
    /// Must only be called on [`StringNames`], will fail if called with self as [`LocalNames`].
    pub fn first_match(
        &self,
        is_client: bool,
        our_options: &LocalNames,
    ) -> Result<Option<&'static str>> {
        match self {
            NameList::String(s) => Ok(if is_client {
                s.first_options_match(our_options)
            } else {
                s.first_string_match(our_options)
            }),
            // we only expect to call first_match() on a packet deserialized
            // as a NameList::String
            NameList::Local(_) => Err(Error::bug()),
        }
    }

    /// Returns whether the `algo` is contained in this list
    pub fn has_algo(&self, algo: &str) -> bool {
        match self {
            NameList::String(s) => s.has_algo(algo),
            NameList::Local(s) => s.0.iter().any(|n| *n == algo),
        }
    }

    /// Returns the first algorithm in the list, or `""` if the list is empty.
    pub fn first(&self) -> &str {
        match self {
            NameList::String(s) => s.first(),
            NameList::Local(s) => s.first(),
        }
    }

    /// Iterates over the names
    pub fn iter(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            NameList::String(s) => {
                if s.0.is_empty() {
                    Box::new(core::iter::empty())
                } else {
                    Box::new(s.0.split(Comma).map(|n| n.as_str()))
                }
            }
            NameList::Local(s) => Box::new(s.0.iter().copied()),
        }
    }

    /// Returns a `String` variant namelist with a single name.
    pub fn single(name: &'a str) -> Result<Self> {
        AsciiStr::from_ascii(name.as_bytes())
            .map_err(|_| Error::BadString)
            .map(|n| Self::String(StringNames(n)))
    }
}

impl StringNames<'_> {
    /// Returns the first name in this namelist that matches one of the provided options
    fn first_string_match(&self, options: &LocalNames) -> Option<&'static str> {
        for n in self.0.split(Comma) {
            for o in options.0.iter() {
                if n == *o {
                    return Some(*o);
                }
            }
        }
        None
    }

    /// Returns the first of "options" that is in this namelist
    fn first_options_match(&self, options: &LocalNames) -> Option<&'static str> {
        for o in options.0.iter() {
            for n in self.0.split(Comma) {
                if n == *o {
                    return Some(*o);
                }
            }
        }
        None
    }

    fn first(&self) -> &str {
        self.0.split(Comma).next().map(|n| n.as_str()).unwrap_or("")
    }

    fn has_algo(&self, algo: &str) -> bool {
        self.0.split(Comma).any(|a| a == algo)
    }
}

impl LocalNames {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn first(&self) -> &str {
        self.0.first().copied().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use crate::namelist::*;
    use crate::sshwire;

    #[test]
    fn test_match() {
        let r1 = NameList::String("rho,cog".try_into().unwrap());
        let r2 = NameList::String("woe".try_into().unwrap());
        let l1 = LocalNames::from(["rho", "cog"].as_slice());
        let l2 = LocalNames::from(["cog", "rho"].as_slice());
        let l3 = LocalNames::from(["now", "woe"].as_slice());
        assert_eq!(r1.first_match(true, &l1).unwrap(), Some("rho"));
        assert_eq!(r1.first_match(false, &l1).unwrap(), Some("rho"));
        assert_eq!(r1.first_match(true, &l2).unwrap(), Some("cog"));
        assert_eq!(r1.first_match(false, &l2).unwrap(), Some("rho"));
        assert_eq!(r2.first_match(false, &l1).unwrap(), None);
        assert_eq!(r2.first_match(false, &l2).unwrap(), None);
        assert_eq!(r2.first_match(false, &l3).unwrap(), Some("woe"));
    }

    #[test]
    fn test_localnames_serialize() {
        let tests: Vec<&[&str]> = vec![
            &["foo", "quux", "boo"],
            &[],
            &["one"],
            &["one", "2"],
            &["", "2"],
            &["3", ""],
        ];
        for t in tests.iter() {
            let n = LocalNames::from(*t);
            let n = NameList::Local(&n);
            let buf = sshwire::write_ssh_vec(&n).unwrap();
            let out1 = core::str::from_utf8(&buf).unwrap();
            // check that a join with std gives the same result.
            assert_eq!(buf[..4], ((buf.len() - 4) as u32).to_be_bytes());
            assert_eq!(out1[4..], t.join(","));
        }
    }

    #[test]
    fn test_first() {
        let tests: Vec<&[&str]> = vec![&["foo", "quux", "boo"], &[], &["one"]];

        for t in tests.iter() {
            let l = LocalNames::from(*t);
            let l = NameList::Local(&l);
            let x = t.join(",");
            let s: NameList = x.as_str().try_into().unwrap();
            assert_eq!(l.first(), s.first());
            if t.is_empty() {
                assert_eq!(l.first(), "");
            } else {
                assert_eq!(l.first(), t[0]);
            }
        }
    }

    #[test]
    fn test_has_algo() {
        fn n(list: &str, has: &str) -> bool {
            let s: NameList = list.try_into().unwrap();
            s.has_algo(has)
        }
        assert!(n("", ""));
        assert!(!n("", "one"));
        assert!(!n("zzz", ""));
        assert!(n("zzz", "zzz"));
        assert!(!n("zz,more", "zzz"));
        assert!(n("zzz,boo", "boo"));
        assert!(!n("zzz,boo", "urp"));
    }

    #[test]
    fn iterate() {
        let s: NameList = "password,publickey".try_into().unwrap();
        assert_eq!(s.iter().collect::<Vec<_>>(), ["password", "publickey"]);
        let s: NameList = "".try_into().unwrap();
        assert_eq!(s.iter().count(), 0);
    }

    #[test]
    fn decode_rejects_control() {
        let b = [0u8, 0, 0, 3, b'a', 0x01, b'b'];
        assert!(sshwire::read_ssh::<NameList>(&b, None).is_err());
    }
}
