//! Block group descriptors and their on-disk table.
//!
//! Each group is described by a fixed-size record in the descriptor table
//! following the superblock. Operations never hold a descriptor directly;
//! they work through a [`GroupRef`] acquired from the mounted filesystem and
//! written back when released.

use crate::fs::{Fs, FsError};
use crate::io::BlockStorage;
use crate::sb::{RoCompatFeatures, Superblock, GROUP_DESC_SIZE_MAX};
use std::convert::TryInto;

/// Per-group metadata: where the group's block bitmap lives, how many of its
/// blocks are free, and the stored bitmap checksum split into halves.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDesc {
    /// Absolute block address of the group's block bitmap.
    pub bitmap_block: u64,
    /// Free blocks remaining in this group.
    pub free_blocks_count: u32,
    /// Low 16 bits of the bitmap checksum.
    pub bitmap_csum_lo: u16,
    /// High 16 bits, persisted only with the extended descriptor size.
    pub bitmap_csum_hi: u16,
}

impl GroupDesc {
    /// Decodes a descriptor record. `desc_size` selects whether the checksum
    /// extension is present.
    pub fn parse(buf: &[u8], desc_size: u16) -> Self {
        let bitmap_csum_hi = if desc_size == GROUP_DESC_SIZE_MAX {
            u16::from_le_bytes(buf[32..34].try_into().unwrap())
        } else {
            0
        };
        Self {
            bitmap_block: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            free_blocks_count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            bitmap_csum_lo: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            bitmap_csum_hi,
        }
    }

    /// Serializes the descriptor into a `desc_size`-byte record.
    pub fn serialize(&self, desc_size: u16) -> Vec<u8> {
        let mut encoded = vec![0u8; desc_size as usize];
        encoded[0..8].copy_from_slice(&self.bitmap_block.to_le_bytes());
        encoded[8..12].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        encoded[12..14].copy_from_slice(&self.bitmap_csum_lo.to_le_bytes());
        if desc_size == GROUP_DESC_SIZE_MAX {
            encoded[32..34].copy_from_slice(&self.bitmap_csum_hi.to_le_bytes());
        }
        encoded
    }
}

/// A scoped reference to one group's descriptor. Acquired at the start of an
/// allocator operation, mutated in memory, and released (written back if
/// dirty) before the operation returns.
#[derive(Debug)]
pub struct GroupRef {
    pub desc: GroupDesc,
    pub index: u32,
    pub dirty: bool,
}

/// Recomputes the group's bitmap checksum and stores it in the descriptor.
///
/// No-op unless the metadata checksum feature is enabled. The checksum is
/// crc32c seeded with all-ones over the volume UUID, extended over the first
/// `blocks_per_group / 8` bytes of the bitmap. The high half is only stored
/// when the descriptor record is large enough to hold it.
///
/// Must be called after every bit mutation, before the bitmap block is
/// written back.
pub fn set_bitmap_checksum(sb: &Superblock, desc: &mut GroupDesc, bitmap: &[u8]) {
    if !sb.ro_compat.contains(RoCompatFeatures::METADATA_CSUM) {
        return;
    }
    let mut csum = crc32c::crc32c_append(!0u32, &sb.uuid);
    csum = crc32c::crc32c_append(csum, &bitmap[..(sb.blocks_per_group / 8) as usize]);

    desc.bitmap_csum_lo = (csum & 0xffff) as u16;
    if sb.desc_size == GROUP_DESC_SIZE_MAX {
        desc.bitmap_csum_hi = (csum >> 16) as u16;
    }
}

impl<T: BlockStorage> Fs<T> {
    /// Loads the descriptor for `bgid` into a fresh [`GroupRef`].
    pub fn get_group_ref(&mut self, bgid: u32) -> Result<GroupRef, FsError> {
        let (blocknr, offset) = self.group_desc_location(bgid);
        let block = self.block_get(blocknr)?;
        let desc = GroupDesc::parse(
            &block.data[offset..offset + self.sb.desc_size as usize],
            self.sb.desc_size,
        );
        Ok(GroupRef {
            desc,
            index: bgid,
            dirty: false,
        })
    }

    /// Releases a group reference, persisting the descriptor if it was
    /// mutated. Propagates descriptor table I/O errors.
    pub fn put_group_ref(&mut self, bg_ref: &mut GroupRef) -> Result<(), FsError> {
        if !bg_ref.dirty {
            return Ok(());
        }
        let (blocknr, offset) = self.group_desc_location(bg_ref.index);
        let mut block = self.block_get(blocknr)?;
        let record = bg_ref.desc.serialize(self.sb.desc_size);
        block.data[offset..offset + record.len()].copy_from_slice(&record);
        block.dirty = true;
        self.block_set(&mut block)?;
        bg_ref.dirty = false;
        Ok(())
    }

    /// Locates the descriptor table block and in-block offset for `bgid`.
    fn group_desc_location(&self, bgid: u32) -> (u64, usize) {
        let byte_offset = u64::from(bgid) * u64::from(self.sb.desc_size);
        let block_size = u64::from(self.sb.block_size);
        (
            self.gdt_first_block() + byte_offset / block_size,
            (byte_offset % block_size) as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb::GROUP_DESC_SIZE;

    fn csum_sb(desc_size: u16) -> Superblock {
        let mut sb = Superblock::new();
        sb.block_size = 1024;
        sb.blocks_per_group = 8192;
        sb.blocks_count = 8192;
        sb.desc_size = desc_size;
        sb.ro_compat = RoCompatFeatures::METADATA_CSUM;
        sb.uuid = *b"fedcba9876543210";
        sb
    }

    #[test]
    fn can_encode_and_decode_descriptors() {
        let desc = GroupDesc {
            bitmap_block: 0x1_0000_0042,
            free_blocks_count: 7777,
            bitmap_csum_lo: 0xBEEF,
            bitmap_csum_hi: 0xDEAD,
        };

        let parsed = GroupDesc::parse(&desc.serialize(GROUP_DESC_SIZE_MAX), GROUP_DESC_SIZE_MAX);
        assert_eq!(parsed, desc);

        // The short record drops the high checksum half.
        let parsed = GroupDesc::parse(&desc.serialize(GROUP_DESC_SIZE), GROUP_DESC_SIZE);
        assert_eq!(parsed.bitmap_csum_lo, 0xBEEF);
        assert_eq!(parsed.bitmap_csum_hi, 0);
    }

    #[test]
    fn checksum_is_idempotent_on_unchanged_bitmap() {
        let sb = csum_sb(GROUP_DESC_SIZE_MAX);
        let bitmap = vec![0xA5_u8; 1024];
        let mut desc = GroupDesc {
            bitmap_block: 3,
            free_blocks_count: 0,
            bitmap_csum_lo: 0,
            bitmap_csum_hi: 0,
        };

        set_bitmap_checksum(&sb, &mut desc, &bitmap);
        let (lo, hi) = (desc.bitmap_csum_lo, desc.bitmap_csum_hi);
        set_bitmap_checksum(&sb, &mut desc, &bitmap);
        assert_eq!((desc.bitmap_csum_lo, desc.bitmap_csum_hi), (lo, hi));
    }

    #[test]
    fn checksum_changes_when_bitmap_changes() {
        let sb = csum_sb(GROUP_DESC_SIZE_MAX);
        let mut bitmap = vec![0u8; 1024];
        let mut desc = GroupDesc {
            bitmap_block: 3,
            free_blocks_count: 0,
            bitmap_csum_lo: 0,
            bitmap_csum_hi: 0,
        };

        set_bitmap_checksum(&sb, &mut desc, &bitmap);
        let before = (desc.bitmap_csum_lo, desc.bitmap_csum_hi);
        crate::bitmap::bit_set(&mut bitmap, 12);
        set_bitmap_checksum(&sb, &mut desc, &bitmap);
        assert_ne!((desc.bitmap_csum_lo, desc.bitmap_csum_hi), before);
    }

    #[test]
    fn short_descriptors_keep_only_the_low_half() {
        let sb = csum_sb(GROUP_DESC_SIZE);
        let bitmap = vec![0x5A_u8; 1024];
        let mut desc = GroupDesc {
            bitmap_block: 3,
            free_blocks_count: 0,
            bitmap_csum_lo: 0,
            bitmap_csum_hi: 0,
        };

        set_bitmap_checksum(&sb, &mut desc, &bitmap);
        assert_ne!(desc.bitmap_csum_lo, 0);
        assert_eq!(desc.bitmap_csum_hi, 0);
    }

    #[test]
    fn checksum_updates_are_gated_on_the_feature_flag() {
        let mut sb = csum_sb(GROUP_DESC_SIZE_MAX);
        sb.ro_compat = RoCompatFeatures::empty();
        let bitmap = vec![0xFF_u8; 1024];
        let mut desc = GroupDesc {
            bitmap_block: 3,
            free_blocks_count: 0,
            bitmap_csum_lo: 0,
            bitmap_csum_hi: 0,
        };

        set_bitmap_checksum(&sb, &mut desc, &bitmap);
        assert_eq!((desc.bitmap_csum_lo, desc.bitmap_csum_hi), (0, 0));
    }
}
