use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// 32-byte big-endian hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct H256(pub [u8; 32]);

impl H256 {
    pub const ZERO: H256 = H256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex without a `0x` prefix, always 64 chars.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Topmost 8 bytes interpreted as a big-endian integer.
    pub fn upper64(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().expect("8-byte prefix"))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.hex())
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.hex())
    }
}

impl FromStr for H256 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.len() != 64 {
            bail!("expected 64 hex chars, got {}", digits.len());
        }
        let bytes = hex::decode(digits).context("invalid hex in 32-byte hash")?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(H256(out))
    }
}

impl TryFrom<String> for H256 {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<H256> for String {
    fn from(h: H256) -> String {
        format!("0x{}", h.hex())
    }
}

impl From<[u8; 32]> for H256 {
    fn from(bytes: [u8; 32]) -> Self {
        H256(bytes)
    }
}

/// Nonce as the fixed 16-digit big-endian hex the pools expect, no prefix.
pub fn nonce_hex(nonce: u64) -> String {
    format!("{nonce:016x}")
}

/// Parse a 16-digit nonce back out of its hex form.
pub fn nonce_from_hex(digits: &str) -> Result<u64> {
    let digits = digits.strip_prefix("0x").unwrap_or(digits);
    if digits.len() != 16 {
        bail!("expected 16 hex chars of nonce, got {}", digits.len());
    }
    u64::from_str_radix(digits, 16).context("invalid nonce hex")
}

/// Candidate is valid iff its value is strictly below the boundary, both
/// read as 256-bit big-endian integers.
pub fn value_meets_boundary(value: &[u8; 32], boundary: &H256) -> bool {
    value < &boundary.0
}

pub fn format_hashrate(hps: f64) -> String {
    if hps >= 1_000_000_000.0 {
        return format!("{:.2} GH/s", hps / 1_000_000_000.0);
    }
    if hps >= 1_000_000.0 {
        return format!("{:.2} MH/s", hps / 1_000_000.0);
    }
    if hps >= 1_000.0 {
        return format!("{:.2} KH/s", hps / 1_000.0);
    }
    format!("{hps:.2} H/s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h256_parses_with_and_without_prefix() {
        let with = "0x00000000000000000000000000000000000000000000000000000000000012ab";
        let without = &with[2..];
        let a: H256 = with.parse().expect("prefixed hash should parse");
        let b: H256 = without.parse().expect("bare hash should parse");
        assert_eq!(a, b);
        assert_eq!(a.0[30], 0x12);
        assert_eq!(a.0[31], 0xab);
        assert_eq!(format!("{a}"), with);
    }

    #[test]
    fn h256_rejects_wrong_lengths() {
        assert!("0x1234".parse::<H256>().is_err());
        assert!("zz".repeat(32).parse::<H256>().is_err());
    }

    #[test]
    fn upper64_reads_big_endian_prefix() {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&[0, 0, 0, 0, 0xff, 0xff, 0, 0]);
        assert_eq!(H256(bytes).upper64(), 0x0000_0000_ffff_0000);
    }

    #[test]
    fn nonce_hex_round_trips() {
        for nonce in [0u64, 1, 0x08c0_0000_0000_0001, u64::MAX] {
            let hex = nonce_hex(nonce);
            assert_eq!(hex.len(), 16);
            assert_eq!(
                nonce_from_hex(&hex).expect("nonce hex should parse"),
                nonce
            );
        }
    }

    #[test]
    fn boundary_comparison_is_strict_big_endian() {
        let boundary = H256({
            let mut b = [0u8; 32];
            b[0] = 0x10;
            b
        });
        let below = [0x0fu8; 32];
        let equal = boundary.0;
        let above = [0x11u8; 32];
        assert!(value_meets_boundary(&below, &boundary));
        assert!(!value_meets_boundary(&equal, &boundary));
        assert!(!value_meets_boundary(&above, &boundary));
    }

    #[test]
    fn hashrate_units() {
        assert_eq!(format_hashrate(12.0), "12.00 H/s");
        assert_eq!(format_hashrate(34_500.0), "34.50 KH/s");
        assert_eq!(format_hashrate(2_000_000.0), "2.00 MH/s");
        assert_eq!(format_hashrate(3_100_000_000.0), "3.10 GH/s");
    }
}
