//! zlib-compatible Adler-32.

/// Seed value, equal to `adler32(0, NULL, 0)` in zlib.
pub const ADLER32_INIT: u32 = 1;

const MOD_ADLER: u32 = 65521;
/// Largest n such that 255n(n+1)/2 + (n+1)(MOD_ADLER-1) fits in u32.
const NMAX: usize = 5552;

/// Continue an Adler-32 checksum from `seed` over `data`.
pub fn adler32(seed: u32, data: &[u8]) -> u32 {
    let mut a = seed & 0xFFFF;
    let mut b = seed >> 16;
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}
