use crate::fs::FsError;
use bitflags::bitflags;
use std::convert::TryInto;

const SB_MAGIC: u32 = 0x4247_4653; // "SFGB"

/// Number of bytes of a block occupied by the encoded superblock record.
pub const SB_RECORD_LEN: usize = 60;

/// Size in bytes of a group descriptor without the checksum extension.
pub const GROUP_DESC_SIZE: u16 = 32;
/// Size in bytes of a group descriptor carrying the high checksum half.
pub const GROUP_DESC_SIZE_MAX: u16 = 64;

bitflags! {
    /// Read-only compatible feature set: an implementation that does not
    /// understand one of these may still mount the volume read-only.
    pub struct RoCompatFeatures: u32 {
        const METADATA_CSUM = 0x0400;
    }
}

bitflags! {
    /// Incompatible feature set: an implementation that does not understand
    /// one of these must refuse to mount.
    pub struct IncompatFeatures: u32 {
        const FLEX_BG = 0x0200;
    }
}

/// The first block of the file system, storing the volume-wide parameters
/// needed for mounting and the global free-space counter.
///
/// Every allocation or free mutates `free_blocks_count`; the mounted
/// filesystem owns this structure and writes it back on sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Superblock {
    /// A 32-bit identifying constant.
    pub magic: u32,
    /// Size in bytes of one filesystem block.
    pub block_size: u32,
    /// Number of blocks managed by a single group bitmap. Must not exceed the
    /// bit capacity of one bitmap block (`block_size * 8`).
    pub blocks_per_group: u32,
    /// 1 when block 0 is reserved and group 0 starts at block 1, otherwise 0.
    pub first_data_block: u32,
    /// Total number of blocks on the volume, reserved block included.
    pub blocks_count: u64,
    /// Blocks available for allocation across all groups.
    pub free_blocks_count: u64,
    /// On-disk size of a group descriptor record, 32 or 64 bytes.
    pub desc_size: u16,
    pub ro_compat: RoCompatFeatures,
    pub incompat: IncompatFeatures,
    /// Volume identity, seeds the bitmap checksums.
    pub uuid: [u8; 16],
}

impl Superblock {
    pub fn new() -> Self {
        Self {
            magic: SB_MAGIC,
            block_size: 4096,
            blocks_per_group: 4096 * 8,
            first_data_block: 0,
            blocks_count: 0,
            free_blocks_count: 0,
            desc_size: GROUP_DESC_SIZE,
            ro_compat: RoCompatFeatures::empty(),
            incompat: IncompatFeatures::empty(),
            uuid: [0; 16],
        }
    }

    /// Decodes the superblock record from the start of its disk block. The
    /// encoding is a series of struct fields with little endian alignment.
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < SB_RECORD_LEN {
            return Err(FsError::InvalidSuperblock("record truncated"));
        }

        let sb = Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            block_size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            blocks_per_group: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            first_data_block: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            blocks_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            free_blocks_count: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            desc_size: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
            ro_compat: RoCompatFeatures::from_bits_truncate(u32::from_le_bytes(
                buf[36..40].try_into().unwrap(),
            )),
            incompat: IncompatFeatures::from_bits_truncate(u32::from_le_bytes(
                buf[40..44].try_into().unwrap(),
            )),
            uuid: buf[44..60].try_into().unwrap(),
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Serializes the superblock record for writing into its disk block.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(SB_RECORD_LEN);
        encoded.extend_from_slice(&self.magic.to_le_bytes());
        encoded.extend_from_slice(&self.block_size.to_le_bytes());
        encoded.extend_from_slice(&self.blocks_per_group.to_le_bytes());
        encoded.extend_from_slice(&self.first_data_block.to_le_bytes());
        encoded.extend_from_slice(&self.blocks_count.to_le_bytes());
        encoded.extend_from_slice(&self.free_blocks_count.to_le_bytes());
        encoded.extend_from_slice(&self.desc_size.to_le_bytes());
        encoded.extend_from_slice(&[0u8; 2]);
        encoded.extend_from_slice(&self.ro_compat.bits().to_le_bytes());
        encoded.extend_from_slice(&self.incompat.bits().to_le_bytes());
        encoded.extend_from_slice(&self.uuid);
        encoded
    }

    pub fn validate(&self) -> Result<(), FsError> {
        if self.magic != SB_MAGIC {
            return Err(FsError::InvalidSuperblock("bad magic"));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(FsError::InvalidSuperblock("bad block size"));
        }
        if self.blocks_per_group == 0 || self.blocks_per_group > self.block_size * 8 {
            return Err(FsError::InvalidSuperblock(
                "blocks per group exceeds bitmap capacity",
            ));
        }
        if self.first_data_block > 1 {
            return Err(FsError::InvalidSuperblock("bad first data block"));
        }
        if self.desc_size != GROUP_DESC_SIZE && self.desc_size != GROUP_DESC_SIZE_MAX {
            return Err(FsError::InvalidSuperblock("bad descriptor size"));
        }
        if self.blocks_count <= u64::from(self.first_data_block) {
            return Err(FsError::InvalidSuperblock("no data blocks"));
        }
        Ok(())
    }

    /// Number of block groups on the volume. The last group may be partial.
    pub fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count - u64::from(self.first_data_block);
        let bpg = u64::from(self.blocks_per_group);
        ((data_blocks + bpg - 1) / bpg) as u32
    }

    /// Number of blocks actually backed by storage in the given group; short
    /// for the final group of a volume whose size is not a multiple of
    /// `blocks_per_group`.
    pub fn blocks_in_group(&self, bgid: u32) -> u32 {
        let count = self.group_count();
        if bgid < count - 1 {
            self.blocks_per_group
        } else {
            let data_blocks = self.blocks_count - u64::from(self.first_data_block);
            (data_blocks - u64::from(count - 1) * u64::from(self.blocks_per_group)) as u32
        }
    }
}
