use crate::alloc;
use crate::bitmap;
use crate::group::{self, GroupDesc};
use crate::io::BlockStorage;
use crate::sb::{IncompatFeatures, RoCompatFeatures, Superblock, GROUP_DESC_SIZE_MAX};

use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    /// A bitmap, descriptor, or superblock transfer failed at the device.
    /// Side effects already applied by the current operation are not rolled
    /// back; the volume is left for the caller to retry or repair.
    #[error("block device i/o failed")]
    Io(#[from] std::io::Error),
    /// No free block exists in any group. Not a corruption: callers may react
    /// by reclaiming space and retrying.
    #[error("no free blocks left in any block group")]
    OutOfSpace,
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(&'static str),
}

/// One cached filesystem block: the raw buffer, its absolute address, and a
/// dirty flag. `Fs::block_set` writes the buffer back only when dirty.
pub struct Block {
    pub addr: u64,
    pub data: Vec<u8>,
    pub dirty: bool,
}

/// Parameters for formatting a volume.
pub struct MkfsOptions {
    pub block_size: u32,
    pub blocks_count: u64,
    pub blocks_per_group: u32,
    pub first_data_block: u32,
    pub desc_size: u16,
    pub ro_compat: RoCompatFeatures,
    pub incompat: IncompatFeatures,
    pub uuid: [u8; 16],
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_count: 0,
            blocks_per_group: 4096 * 8,
            first_data_block: 0,
            desc_size: GROUP_DESC_SIZE_MAX,
            ro_compat: RoCompatFeatures::METADATA_CSUM,
            incompat: IncompatFeatures::FLEX_BG,
            uuid: [0; 16],
        }
    }
}

/// A mounted volume: owns the block device and the in-memory superblock.
///
/// # Layout
/// =====================================================================
/// | SuperBlock | Group descriptor table | Group bitmaps | Data region |
/// =====================================================================
///
/// When `first_data_block` is 1 the superblock occupies the reserved block 0,
/// which no group bitmap tracks; otherwise block 0 belongs to group 0 and its
/// bit is pre-set at format time.
pub struct Fs<T: BlockStorage> {
    pub(crate) dev: T,
    pub sb: Superblock,
}

impl<T: BlockStorage> Fs<T> {
    /// Formats the device and mounts the resulting volume: writes the
    /// superblock, descriptor table, and one bitmap per group with all
    /// metadata blocks pre-marked used.
    pub fn mkfs(dev: T, opts: &MkfsOptions) -> Result<Self, FsError> {
        let mut sb = Superblock::new();
        sb.block_size = opts.block_size;
        sb.blocks_per_group = opts.blocks_per_group;
        sb.first_data_block = opts.first_data_block;
        sb.blocks_count = opts.blocks_count;
        sb.desc_size = opts.desc_size;
        sb.ro_compat = opts.ro_compat;
        sb.incompat = opts.incompat;
        sb.uuid = opts.uuid;
        sb.validate()?;

        if dev.block_size() != sb.block_size as usize {
            return Err(FsError::InvalidSuperblock(
                "device block size does not match",
            ));
        }

        let mut fs = Fs { dev, sb };
        let block_size = fs.sb.block_size as usize;
        let group_count = fs.sb.group_count();
        let gdt_blocks = fs.gdt_blocks();

        // Superblock, descriptor table, then one bitmap block per group.
        let meta_end = 1 + gdt_blocks + u64::from(group_count);
        if meta_end >= fs.sb.blocks_count {
            return Err(FsError::InvalidSuperblock("volume too small for metadata"));
        }

        let mut gdt = vec![0u8; (gdt_blocks as usize) * block_size];
        for bgid in 0..group_count {
            let bitmap_addr = 1 + gdt_blocks + u64::from(bgid);
            let mut bmap = vec![0u8; block_size];

            // Bits past the end of a partial group never correspond to real
            // blocks; keep them permanently set.
            let blocks_in_group = fs.sb.blocks_in_group(bgid);
            for pad in blocks_in_group..(block_size as u32 * 8) {
                bitmap::bit_set(&mut bmap, pad);
            }

            let mut used = 0;
            for baddr in 0..meta_end {
                if baddr == 0 && fs.sb.first_data_block != 0 {
                    // The reserved block is outside every group.
                    continue;
                }
                if alloc::group_of_block(&fs.sb, baddr) == bgid {
                    bitmap::bit_set(&mut bmap, alloc::block_to_index_in_group(&fs.sb, baddr));
                    used += 1;
                }
            }

            let mut desc = GroupDesc {
                bitmap_block: bitmap_addr,
                free_blocks_count: blocks_in_group - used,
                bitmap_csum_lo: 0,
                bitmap_csum_hi: 0,
            };
            group::set_bitmap_checksum(&fs.sb, &mut desc, &bmap);
            fs.sb.free_blocks_count += u64::from(desc.free_blocks_count);

            let mut bitmap_block = Block {
                addr: bitmap_addr,
                data: bmap,
                dirty: true,
            };
            fs.block_set(&mut bitmap_block)?;

            let offset = bgid as usize * fs.sb.desc_size as usize;
            let record = desc.serialize(fs.sb.desc_size);
            gdt[offset..offset + record.len()].copy_from_slice(&record);
        }

        for i in 0..gdt_blocks {
            let start = i as usize * block_size;
            let mut gdt_block = Block {
                addr: fs.gdt_first_block() + i,
                data: gdt[start..start + block_size].to_vec(),
                dirty: true,
            };
            fs.block_set(&mut gdt_block)?;
        }

        fs.sync()?;
        debug!(
            "formatted volume: {} blocks in {} groups, {} free",
            fs.sb.blocks_count, group_count, fs.sb.free_blocks_count
        );
        Ok(fs)
    }

    /// Mounts an already formatted device.
    pub fn open(mut dev: T) -> Result<Self, FsError> {
        let mut buf = vec![0u8; dev.block_size()];
        dev.read_block(0, &mut buf)?;
        let sb = Superblock::parse(&buf)?;
        if sb.block_size as usize != dev.block_size() {
            return Err(FsError::InvalidSuperblock(
                "device block size does not match",
            ));
        }
        Ok(Fs { dev, sb })
    }

    /// Persists the in-memory superblock and flushes the device.
    pub fn sync(&mut self) -> Result<(), FsError> {
        let mut block = self.block_get(0)?;
        let record = self.sb.serialize();
        block.data[..record.len()].copy_from_slice(&record);
        block.dirty = true;
        self.block_set(&mut block)?;
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Reads one block from the device into a fresh clean buffer.
    pub(crate) fn block_get(&mut self, addr: u64) -> Result<Block, FsError> {
        let mut data = vec![0u8; self.sb.block_size as usize];
        self.dev.read_block(addr, &mut data)?;
        Ok(Block {
            addr,
            data,
            dirty: false,
        })
    }

    /// Writes a block back if it was mutated, clearing the dirty flag. A
    /// clean block is a no-op, keeping release calls uniform on paths that
    /// did not modify the buffer.
    pub(crate) fn block_set(&mut self, block: &mut Block) -> Result<(), FsError> {
        if block.dirty {
            self.dev.write_block(block.addr, &block.data)?;
            block.dirty = false;
        }
        Ok(())
    }

    /// First block of the group descriptor table, directly after the
    /// superblock.
    pub(crate) fn gdt_first_block(&self) -> u64 {
        1
    }

    /// Number of blocks occupied by the descriptor table.
    pub(crate) fn gdt_blocks(&self) -> u64 {
        let table_bytes = u64::from(self.sb.group_count()) * u64::from(self.sb.desc_size);
        let block_size = u64::from(self.sb.block_size);
        (table_bytes + block_size - 1) / block_size
    }
}
