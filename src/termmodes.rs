//! Encoded terminal modes for a `pty-req`, RFC4254 section 8.
//!
//! The encoding is a sequence of `byte opcode, uint32 argument` pairs,
//! terminated by `TTY_OP_END`.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

pub const TTY_OP_END: u8 = 0;
pub const VINTR: u8 = 1;
pub const VQUIT: u8 = 2;
pub const VERASE: u8 = 3;
pub const VKILL: u8 = 4;
pub const VEOF: u8 = 5;
pub const ISIG: u8 = 50;
pub const ICANON: u8 = 51;
pub const ECHO: u8 = 53;
pub const IUTF8: u8 = 42;
pub const OPOST: u8 = 70;
pub const ONLCR: u8 = 72;
pub const CS8: u8 = 91;
pub const TTY_OP_ISPEED: u8 = 128;
pub const TTY_OP_OSPEED: u8 = 129;

/// Opcodes 160 to 255 are undefined and stop parsing
const FIRST_UNDEFINED: u8 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePair {
    pub opcode: u8,
    pub arg: u32,
}

/// A list of terminal modes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermModes(pub Vec<ModePair>);

impl TermModes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a mode, replacing an existing value
    pub fn set(&mut self, opcode: u8, arg: u32) {
        match self.0.iter_mut().find(|m| m.opcode == opcode) {
            Some(m) => m.arg = arg,
            None => self.0.push(ModePair { opcode, arg }),
        }
    }

    pub fn get(&self, opcode: u8) -> Option<u32> {
        self.0.iter().find(|m| m.opcode == opcode).map(|m| m.arg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.0.len() * 5 + 1);
        for m in self.0.iter().filter(|m| m.opcode != TTY_OP_END) {
            v.push(m.opcode);
            v.extend_from_slice(&m.arg.to_be_bytes());
        }
        v.push(TTY_OP_END);
        v
    }

    /// Parses encoded modes. A missing terminator is tolerated.
    pub fn decode(mut b: &[u8]) -> Result<Self> {
        let mut modes = TermModes::new();
        while let Some((&opcode, rest)) = b.split_first() {
            if opcode == TTY_OP_END || opcode >= FIRST_UNDEFINED {
                break;
            }
            let Some(&[a0, a1, a2, a3]) = rest.get(..4) else {
                return Err(Error::SSHProtoError);
            };
            let arg = u32::from_be_bytes([a0, a1, a2, a3]);
            modes.0.push(ModePair { opcode, arg });
            b = &rest[4..];
        }
        Ok(modes)
    }
}

#[cfg(test)]
mod tests {
    use crate::termmodes::*;

    #[test]
    fn encode_decode() {
        let mut m = TermModes::new();
        m.set(ECHO, 1);
        m.set(TTY_OP_OSPEED, 38400);
        m.set(ECHO, 0);
        let b = m.encode();
        assert_eq!(b, [53, 0, 0, 0, 0, 129, 0, 0, 0x96, 0, 0]);
        let d = TermModes::decode(&b).unwrap();
        assert_eq!(d.get(ECHO), Some(0));
        assert_eq!(d, m);
    }

    #[test]
    fn truncated() {
        assert!(TermModes::decode(&[ECHO, 0, 0]).is_err());
        assert!(TermModes::decode(&[]).unwrap().0.is_empty());
        // undefined opcode stops parsing
        assert!(TermModes::decode(&[200, 1]).unwrap().0.is_empty());
    }
}
