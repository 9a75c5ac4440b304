//! Trailing block footer (spec §3, §6): every block reserves its last
//! [`FOOTER_SIZE`] bytes for a checksum and small identity fields, verified
//! on every read and stamped on every write.

use bytemuck::{Pod, Zeroable};

use crate::checksum::{block_salt, murmur3_x64_128};
use crate::Error;

pub const FOOTER_SIZE: usize = 32;

pub const BLOCK_TYPE_HEADER: u32 = 1;
pub const BLOCK_TYPE_TREE_HEADER: u32 = 2;
pub const BLOCK_TYPE_NODE: u32 = 3;
pub const BLOCK_TYPE_INDEX: u32 = 4;
pub const BLOCK_TYPE_FREE: u32 = 5;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FooterRaw {
    checksum_lo: u64,
    checksum_hi: u64,
    block_type: u32,
    sequence: u32,
    sub_file_id: u32,
    _reserved: u32,
}

const _: () = assert!(core::mem::size_of::<FooterRaw>() == FOOTER_SIZE);

/// A decoded block footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub checksum: (u64, u64),
    pub block_type: u32,
    pub sequence: u32,
    pub sub_file_id: u32,
}

impl Footer {
    /// Compute and stamp a footer over `block`'s payload (everything
    /// excluding the trailing [`FOOTER_SIZE`] bytes) into the footer bytes
    /// at the tail of `block`.
    pub fn stamp(block: &mut [u8], block_index: u32, sub_file_id: u32, block_type: u32, sequence: u32) {
        let split = block.len() - FOOTER_SIZE;
        let (payload, footer_bytes) = block.split_at_mut(split);
        let salt = block_salt(block_index, sub_file_id, block_type);
        let (lo, hi) = murmur3_x64_128(payload, salt);
        let raw = FooterRaw { checksum_lo: lo, checksum_hi: hi, block_type, sequence, sub_file_id, _reserved: 0 };
        footer_bytes.copy_from_slice(bytemuck::bytes_of(&raw));
    }

    /// Read and verify a block's footer against its payload. Returns
    /// `Error::Corrupt` if the checksum does not match.
    pub fn verify(block: &[u8], block_index: u32) -> Result<Footer, Error> {
        let split = block.len() - FOOTER_SIZE;
        let (payload, footer_bytes) = block.split_at(split);
        let raw: FooterRaw = *bytemuck::from_bytes(footer_bytes);
        let salt = block_salt(block_index, raw.sub_file_id, raw.block_type);
        let (lo, hi) = murmur3_x64_128(payload, salt);
        if lo != raw.checksum_lo || hi != raw.checksum_hi {
            return Err(Error::Corrupt { reason: "block footer checksum mismatch" });
        }
        Ok(Footer { checksum: (lo, hi), block_type: raw.block_type, sequence: raw.sequence, sub_file_id: raw.sub_file_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_then_verify_round_trips() {
        let mut block = [0u8; 256];
        block[..10].copy_from_slice(b"helloworld");
        Footer::stamp(&mut block, 3, 7, BLOCK_TYPE_NODE, 1);
        let footer = Footer::verify(&block, 3).unwrap();
        assert_eq!(footer.block_type, BLOCK_TYPE_NODE);
        assert_eq!(footer.sub_file_id, 7);
        assert_eq!(footer.sequence, 1);
    }

    #[test]
    fn corrupted_payload_fails_verification() {
        let mut block = [0u8; 256];
        Footer::stamp(&mut block, 0, 0, BLOCK_TYPE_NODE, 0);
        block[5] ^= 0xff;
        assert!(matches!(Footer::verify(&block, 0), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn wrong_block_index_fails_verification() {
        let mut block = [0u8; 256];
        Footer::stamp(&mut block, 1, 0, BLOCK_TYPE_NODE, 0);
        assert!(matches!(Footer::verify(&block, 2), Err(Error::Corrupt { .. })));
    }
}
