#![forbid(unsafe_code)]
//! CRC-32 (IEEE) with two interchangeable implementations.
//!
//! The accelerated path delegates to `crc32fast`, which uses SIMD or CPU CRC
//! instructions when available. The portable path is a byte-at-a-time table
//! lookup. Both produce identical values, so a file written with one verifies
//! with the other.

use serde::Deserialize;

/// Streaming checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// Hardware-accelerated CRC-32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

const IEEE_REFLECTED: u32 = 0xEDB8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ IEEE_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_table();

/// Table-driven CRC-32 that needs no CPU features.
#[derive(Clone, Debug)]
pub struct Crc32Portable {
    state: u32,
}

impl Default for Crc32Portable {
    fn default() -> Self {
        Self { state: !0 }
    }
}

impl Checksum for Crc32Portable {
    fn reset(&mut self) {
        self.state = !0;
    }

    fn update(&mut self, bytes: &[u8]) {
        let mut crc = self.state;
        for &b in bytes {
            crc = CRC_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.state = crc;
    }

    fn finalize(&self) -> u32 {
        !self.state
    }
}

/// Which CRC implementation a component uses.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPath {
    /// Pick at open time; currently always the accelerated path.
    #[default]
    Auto,
    /// `crc32fast`.
    Accelerated,
    /// Table-driven fallback.
    Portable,
}

impl ChecksumPath {
    /// Collapses `Auto` into a concrete path.
    pub fn resolve(self) -> ChecksumPath {
        match self {
            ChecksumPath::Auto | ChecksumPath::Accelerated => ChecksumPath::Accelerated,
            ChecksumPath::Portable => ChecksumPath::Portable,
        }
    }

    /// Name used in stats output.
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumPath::Auto => "auto",
            ChecksumPath::Accelerated => "accelerated",
            ChecksumPath::Portable => "portable",
        }
    }

    /// Checksums the concatenation of `parts`.
    pub fn crc32(self, parts: &[&[u8]]) -> u32 {
        match self.resolve() {
            ChecksumPath::Portable => {
                let mut c = Crc32Portable::default();
                for part in parts {
                    c.update(part);
                }
                c.finalize()
            }
            _ => {
                let mut c = Crc32Fast::default();
                for part in parts {
                    c.update(part);
                }
                c.finalize()
            }
        }
    }
}

/// Page checksum: page number, then database salt, then the page with its
/// checksum field zeroed.
pub fn page_crc32(path: ChecksumPath, page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    path.crc32(&[&page_no.to_be_bytes(), &salt.to_be_bytes(), payload])
}
