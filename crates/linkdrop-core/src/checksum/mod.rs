//! Table-driven CRC32 for Linkdrop.
//!
//! Two checksum scopes use this engine and are kept apart on purpose:
//!
//! - [`chunk_crc32`] covers one chunk payload and travels in every chunk
//!   packet header.
//! - [`RunningCrc32`] folds every byte of a transfer, in order, and is
//!   exchanged once in `file-complete-ack` for end-to-end verification.
//!
//! The polynomial is the reflected IEEE one (`0xEDB88320`). The lookup
//! table is built on first use and cached for the life of the process.

use std::sync::OnceLock;

/// Reflected CRC32 (IEEE 802.3) polynomial.
pub const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

static CRC32_TABLE: OnceLock<[u32; 256]> = OnceLock::new();

fn table() -> &'static [u32; 256] {
    CRC32_TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (n, slot) in (0u32..).zip(table.iter_mut()) {
            let mut c = n;
            for _ in 0..8 {
                c = if c & 1 == 1 {
                    CRC32_POLYNOMIAL ^ (c >> 1)
                } else {
                    c >> 1
                };
            }
            *slot = c;
        }
        table
    })
}

/// Initial accumulator value (bitwise complement of zero).
#[must_use]
pub const fn crc32_init() -> u32 {
    !0
}

/// Fold `bytes` into a running accumulator.
#[must_use]
pub fn crc32_update(acc: u32, bytes: &[u8]) -> u32 {
    let table = table();
    bytes.iter().fold(acc, |c, &b| {
        table[((c ^ u32::from(b)) & 0xFF) as usize] ^ (c >> 8)
    })
}

/// Turn an accumulator into the public checksum value.
#[must_use]
pub const fn crc32_finalize(acc: u32) -> u32 {
    !acc
}

/// CRC32 of a single chunk payload, as carried in the chunk packet header.
#[must_use]
pub fn chunk_crc32(payload: &[u8]) -> u32 {
    crc32_finalize(crc32_update(crc32_init(), payload))
}

/// Whole-transfer CRC32 accumulator.
///
/// Each side of a transfer owns its own instance; the two are only
/// compared, never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningCrc32 {
    acc: u32,
    bytes: u64,
}

impl RunningCrc32 {
    /// Start a fresh accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            acc: crc32_init(),
            bytes: 0,
        }
    }

    /// Fold the next run of bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.acc = crc32_update(self.acc, bytes);
        self.bytes += bytes.len() as u64;
    }

    /// Finalized checksum of everything folded so far.
    ///
    /// Does not consume the accumulator, so it may keep growing afterwards.
    #[must_use]
    pub const fn finalize(&self) -> u32 {
        crc32_finalize(self.acc)
    }

    /// Number of bytes folded so far.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Default for RunningCrc32 {
    fn default() -> Self {
        Self::new()
    }
}
