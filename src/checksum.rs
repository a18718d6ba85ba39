//! Fixed-size cryptographic digest used to verify block and image content.

use std::fmt;
use std::io::{self, Read, Write};

pub const CHECKSUM_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; CHECKSUM_SIZE]);

impl Checksum {
    pub fn of_bytes(data: &[u8]) -> Self {
        Checksum(*blake3::hash(data).as_bytes())
    }

    pub fn of_reader<R: Read>(mut r: R) -> io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Checksum(*hasher.finalize().as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; CHECKSUM_SIZE]) -> Self {
        Checksum(bytes)
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.0)
    }

    pub fn read<R: Read>(mut r: R) -> io::Result<Self> {
        let mut bytes = [0u8; CHECKSUM_SIZE];
        r.read_exact(&mut bytes)?;
        Ok(Checksum(bytes))
    }

    /// Constant-time equality: every byte is compared, the result is
    /// OR-accumulated, and nothing short-circuits on the first mismatch.
    pub fn check(&self, other: &Checksum) -> bool {
        let mut diff = 0u8;
        for i in 0..CHECKSUM_SIZE {
            diff |= self.0[i] ^ other.0[i];
        }
        diff == 0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", hex::encode(self.0))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
