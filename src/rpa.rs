//! Resolvable private address derivation.
//!
//! An RPA is `hash || prand`: three random bytes whose two most significant
//! bits are forced to `01`, and a 24-bit hash of them under the device's
//! identity resolving key. Peers holding the same IRK can re-derive the
//! hash and recognise the device across rotations.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use bt_hci::param::BdAddr;
use rand_core::RngCore;

/// Mask of the address-type bits in the prand MSB.
const RESOLVE_ADDR_MASK: u8 = 0xc0;
/// Value of those bits marking a resolvable private address.
const RESOLVE_ADDR_MSB: u8 = 0x40;

/// Security function *e*: encrypt one block with AES-128.
///
/// Key and plaintext are big-endian 128-bit values, as the Security Manager
/// defines them.
pub(crate) fn e(key: u128, plain_text: u128) -> u128 {
    let key_bytes = key.to_be_bytes();
    let cipher = Aes128::new(GenericArray::from_slice(&key_bytes));

    let mut block = plain_text.to_be_bytes();
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));

    u128::from_be_bytes(block)
}

/// Random-address hash function *ah*.
///
/// `prand` is zero-extended into an AES block, encrypted under the IRK, and
/// the low 24 bits of the ciphertext are the hash. Both `prand` and the
/// result are least-significant byte first.
pub(crate) fn ah(irk: u128, prand: [u8; 3]) -> [u8; 3] {
    let padded = u128::from(prand[0]) | u128::from(prand[1]) << 8 | u128::from(prand[2]) << 16;

    let hash = e(irk, padded);

    [hash as u8, (hash >> 8) as u8, (hash >> 16) as u8]
}

/// Derive the address for a given prand: force the RPA marker bits in the
/// prand MSB, hash, and lay the parts out in controller byte order (hash in
/// the low bytes, prand in the high bytes).
pub(crate) fn from_prand(irk: u128, mut prand: [u8; 3]) -> BdAddr {
    prand[2] = (prand[2] & !RESOLVE_ADDR_MASK) | RESOLVE_ADDR_MSB;

    let hash = ah(irk, prand);

    BdAddr::new([hash[0], hash[1], hash[2], prand[0], prand[1], prand[2]])
}

/// Generate a fresh resolvable private address.
///
/// Draws eight random bytes and keeps three as the prand, matching the
/// amount of entropy the security module hands out per request.
pub(crate) fn generate<R: RngCore>(irk: u128, rng: &mut R) -> BdAddr {
    let mut seed = [0u8; 8];
    rng.fill_bytes(&mut seed);

    from_prand(irk, [seed[0], seed[1], seed[2]])
}

#[cfg(test)]
pub(crate) fn is_resolvable_private(address: BdAddr) -> bool {
    address.into_inner()[5] & RESOLVE_ADDR_MASK == RESOLVE_ADDR_MSB
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRng;

    // Sample data from the Core specification (random address hash
    // functions): IRK ec0234a357c8ad05341010a60a397d9b, prand 0x708194.
    const IRK: u128 = 0xec0234a3_57c8ad05_341010a6_0a397d9b;

    #[test]
    fn hash_matches_spec_sample() {
        assert_eq!(ah(IRK, [0x94, 0x81, 0x70]), [0xaa, 0xfb, 0x0d]);
    }

    #[test]
    fn address_layout() {
        // 0x70 already carries the 01 marker, so the prand is unchanged.
        let addr = from_prand(IRK, [0x94, 0x81, 0x70]);
        assert_eq!(addr, BdAddr::new([0xaa, 0xfb, 0x0d, 0x94, 0x81, 0x70]));
        assert!(is_resolvable_private(addr));
    }

    #[test]
    fn marker_bits_are_forced() {
        let addr = from_prand(IRK, [0x00, 0x00, 0xff]);
        assert_eq!(addr.into_inner()[5], 0x7f);

        let addr = from_prand(IRK, [0x00, 0x00, 0x00]);
        assert_eq!(addr.into_inner()[5], 0x40);
    }

    #[test]
    fn generated_addresses_keep_the_rpa_format() {
        let mut rng = TestRng::new(0x1234_5678);
        for _ in 0..64 {
            assert!(is_resolvable_private(generate(IRK, &mut rng)));
        }
    }

    #[test]
    fn same_prand_same_address() {
        let mut a = TestRng::new(42);
        let mut b = TestRng::new(42);
        assert_eq!(generate(IRK, &mut a), generate(IRK, &mut b));
    }
}
