// src/difficulty.rs - Compact target codec and proof-of-work validation

use crate::block::BlockHash;
use anyhow::{bail, Result};
use num_bigint::BigUint;
use num_traits::One;

/// Length of an unpacked target in bytes.
pub const UNPACKED_LEN: usize = 32;
/// Significant bytes kept by the compact encoding.
const SIGNIFICANT_LEN: usize = 3;
/// Largest pad count that still leaves room for the significant bytes.
pub const MAX_PAD: u8 = (UNPACKED_LEN - SIGNIFICANT_LEN) as u8;

/// Packs a 256-bit target into its compact 4-byte form: the first three
/// significant bytes followed by the count of leading zero bytes stripped.
///
/// The encoding is lossy below the third significant byte. A magnitude with
/// more than `MAX_PAD` leading zeros is packed with the pad clamped, so the
/// significant window slides left over the zeros and the value survives a
/// round trip. Only the all-zero magnitude has no valid encoding.
pub fn pack_target(unpacked: &[u8; UNPACKED_LEN]) -> Result<[u8; 4]> {
    let leading = unpacked.iter().take_while(|&&b| b == 0).count();
    if leading == UNPACKED_LEN {
        bail!("cannot pack an all-zero target");
    }
    let pad = leading.min(MAX_PAD as usize);
    Ok([unpacked[pad], unpacked[pad + 1], unpacked[pad + 2], pad as u8])
}

/// Expands a compact 4-byte target back to 256 bits: `pad` zero bytes, the
/// three significant bytes, then zero padding out to 32 bytes.
pub fn unpack_target(packed: &[u8; 4]) -> Result<[u8; UNPACKED_LEN]> {
    let pad = packed[3] as usize;
    if pad > MAX_PAD as usize {
        bail!("target pad {} overflows the 32-byte field", pad);
    }
    let mut unpacked = [0u8; UNPACKED_LEN];
    unpacked[pad..pad + SIGNIFICANT_LEN].copy_from_slice(&packed[..SIGNIFICANT_LEN]);
    Ok(unpacked)
}

/// A hash proves work against a target iff, read as a big-endian 256-bit
/// integer, it is strictly below the target.
pub fn valid_proof_of_work(hash: &BlockHash, target: &[u8; UNPACKED_LEN]) -> bool {
    BigUint::from_bytes_be(hash.as_ref()) < BigUint::from_bytes_be(target)
}

/// Expected work implied by a target: `floor(2^256 / (target + 1))`.
/// Smaller targets are harder to hit and therefore weigh more; fork choice
/// sums this per block along each chain.
pub fn work_from_target(target: &[u8; UNPACKED_LEN]) -> BigUint {
    let space = BigUint::one() << 256;
    space / (BigUint::from_bytes_be(target) + BigUint::one())
}
