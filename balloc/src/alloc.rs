//! Physical block allocation and release.
//!
//! Every operation follows the same discipline: acquire a [`GroupRef`],
//! load the group's bitmap through the block cache, mutate bits, refresh the
//! bitmap checksum, write the bitmap back, adjust the three free-space
//! counters, and release the group reference. Group references and bitmap
//! blocks are released on every exit path, error paths included.
//!
//! There is no rollback: an I/O failure mid-operation surfaces immediately
//! and leaves whatever was already persisted in place for an external
//! integrity checker to repair.

use crate::bitmap;
use crate::fs::{Fs, FsError};
use crate::group::{self, GroupRef};
use crate::io::BlockStorage;
use crate::node::{InodeRef, INODE_BLOCK_SIZE};
use crate::sb::{IncompatFeatures, Superblock};

use log::trace;

/// Computes the number of the block group holding the given block address.
pub fn group_of_block(sb: &Superblock, baddr: u64) -> u32 {
    let mut baddr = baddr;
    if sb.first_data_block != 0 && baddr != 0 {
        baddr -= 1;
    }
    (baddr / u64::from(sb.blocks_per_group)) as u32
}

/// Computes the starting block address of a block group.
pub fn group_first_block(sb: &Superblock, bgid: u32) -> u64 {
    let mut baddr = 0;
    if sb.first_data_block != 0 {
        baddr += 1;
    }
    baddr + u64::from(bgid) * u64::from(sb.blocks_per_group)
}

/// Converts a block address to its bit position within the group's bitmap.
pub fn block_to_index_in_group(sb: &Superblock, baddr: u64) -> u32 {
    let mut baddr = baddr;
    if sb.first_data_block != 0 && baddr != 0 {
        baddr -= 1;
    }
    (baddr % u64::from(sb.blocks_per_group)) as u32
}

/// Converts a bit position within a group's bitmap back to a block address.
pub fn index_in_group_to_block(sb: &Superblock, index: u32, bgid: u32) -> u64 {
    group_first_block(sb, bgid) + u64::from(index)
}

/// Raises a goal index up to the first bit of the group that maps to a real
/// data block. Addresses in the reserved region would otherwise translate to
/// an index before the group's usable range.
fn clamp_to_group_start(sb: &Superblock, index_in_group: u32, bgid: u32) -> u32 {
    let first_index = block_to_index_in_group(sb, group_first_block(sb, bgid));
    index_in_group.max(first_index)
}

impl<T: BlockStorage> Fs<T> {
    /// Applies one block-state change to all three free-space counters:
    /// superblock and group gain `freed` free blocks while the inode loses
    /// the equivalent accounting units (the signs flip for an allocation,
    /// where `freed` is negative). Purely in-memory; marks the group and
    /// inode references dirty.
    fn update_counters(&mut self, inode_ref: &mut InodeRef, bg_ref: &mut GroupRef, freed: i64) {
        self.sb.free_blocks_count = (self.sb.free_blocks_count as i64 + freed) as u64;

        // The inode counts in INODE_BLOCK_SIZE units, not filesystem blocks.
        let unit = i64::from(self.sb.block_size / INODE_BLOCK_SIZE);
        let ino_blocks = i64::from(inode_ref.inode.blocks_count()) - freed * unit;
        inode_ref.inode.set_blocks_count(ino_blocks as u32);
        inode_ref.dirty = true;

        bg_ref.desc.free_blocks_count = (i64::from(bg_ref.desc.free_blocks_count) + freed) as u32;
        bg_ref.dirty = true;
    }

    /// Returns one block to the free pool.
    ///
    /// The bit is cleared without checking its prior state; callers must not
    /// double-free. Counters advance only after the bitmap write succeeds,
    /// so a failed write leaves the accounting untouched.
    pub fn free_block(&mut self, inode_ref: &mut InodeRef, baddr: u64) -> Result<(), FsError> {
        let bgid = group_of_block(&self.sb, baddr);
        let index_in_group = block_to_index_in_group(&self.sb, baddr);

        let mut bg_ref = self.get_group_ref(bgid)?;

        let mut bitmap_block = match self.block_get(bg_ref.desc.bitmap_block) {
            Ok(block) => block,
            Err(err) => {
                let _ = self.put_group_ref(&mut bg_ref);
                return Err(err);
            }
        };

        bitmap::bit_clear(&mut bitmap_block.data, index_in_group);
        group::set_bitmap_checksum(&self.sb, &mut bg_ref.desc, &bitmap_block.data);
        bitmap_block.dirty = true;

        if let Err(err) = self.block_set(&mut bitmap_block) {
            let _ = self.put_group_ref(&mut bg_ref);
            return Err(err);
        }

        self.update_counters(inode_ref, &mut bg_ref, 1);
        self.put_group_ref(&mut bg_ref)
    }

    /// Returns a contiguous run of `count` blocks starting at `first` to the
    /// free pool, walking every group the run spans.
    ///
    /// # Panics
    ///
    /// Without the flexible group layout feature a run can never legally
    /// cross a group boundary; such a call is a precondition violation and
    /// panics rather than corrupting the accounting. The loop must also
    /// consume the count exactly.
    pub fn free_blocks(
        &mut self,
        inode_ref: &mut InodeRef,
        first: u64,
        count: u32,
    ) -> Result<(), FsError> {
        if count == 0 {
            return Ok(());
        }

        let mut first = first;
        let mut count = count;

        let bg_first = group_of_block(&self.sb, first);
        let bg_last = group_of_block(&self.sb, first + u64::from(count) - 1);

        if !self.sb.incompat.contains(IncompatFeatures::FLEX_BG) {
            assert_eq!(
                bg_first, bg_last,
                "contiguous free run crosses a group boundary without flex_bg"
            );
        }

        let mut bgid = bg_first;
        while bgid <= bg_last {
            let mut bg_ref = self.get_group_ref(bgid)?;
            let index_in_group = block_to_index_in_group(&self.sb, first);

            let mut bitmap_block = match self.block_get(bg_ref.desc.bitmap_block) {
                Ok(block) => block,
                Err(err) => {
                    let _ = self.put_group_ref(&mut bg_ref);
                    return Err(err);
                }
            };

            // Bits left before the bitmap runs out; the final group of the
            // run frees only the remainder.
            let mut free_cnt = self.sb.block_size * 8 - index_in_group;
            if count < free_cnt {
                free_cnt = count;
            }

            bitmap::bits_clear_range(&mut bitmap_block.data, index_in_group, free_cnt);
            group::set_bitmap_checksum(&self.sb, &mut bg_ref.desc, &bitmap_block.data);
            bitmap_block.dirty = true;

            count -= free_cnt;
            first += u64::from(free_cnt);

            if let Err(err) = self.block_set(&mut bitmap_block) {
                let _ = self.put_group_ref(&mut bg_ref);
                return Err(err);
            }

            self.update_counters(inode_ref, &mut bg_ref, i64::from(free_cnt));
            self.put_group_ref(&mut bg_ref)?;

            bgid += 1;
        }

        assert_eq!(count, 0, "range free did not consume its full block count");
        Ok(())
    }

    /// Allocates one block, preferring the caller-supplied goal address.
    ///
    /// Search order: the exact goal bit, then forward from the goal to the
    /// next 64-bit boundary, then any free bit from the goal to the end of
    /// the goal group, then every other group round-robin starting after the
    /// goal group (the goal group is revisited last to pick up free bits
    /// before the goal). The first free bit found wins.
    pub fn alloc_block(&mut self, inode_ref: &mut InodeRef, goal: u64) -> Result<u64, FsError> {
        let bgid = group_of_block(&self.sb, goal);
        let mut index_in_group = block_to_index_in_group(&self.sb, goal);

        let mut bg_ref = self.get_group_ref(bgid)?;

        if bg_ref.desc.free_blocks_count > 0 {
            index_in_group = clamp_to_group_start(&self.sb, index_in_group, bgid);

            let mut bitmap_block = match self.block_get(bg_ref.desc.bitmap_block) {
                Ok(block) => block,
                Err(err) => {
                    let _ = self.put_group_ref(&mut bg_ref);
                    return Err(err);
                }
            };

            let blocks_in_group = self.sb.blocks_in_group(bgid);

            let hit = if bitmap::bit_is_clear(&bitmap_block.data, index_in_group) {
                // The goal itself is free.
                Some(index_in_group)
            } else {
                // Scan forward to the next 64-bit boundary, then fall back to
                // the rest of the group.
                let end_idx = ((index_in_group + 63) & !63).min(blocks_in_group);
                (index_in_group + 1..end_idx)
                    .find(|&idx| bitmap::bit_is_clear(&bitmap_block.data, idx))
                    .or_else(|| {
                        bitmap::find_first_clear(
                            &bitmap_block.data,
                            index_in_group,
                            blocks_in_group,
                        )
                    })
            };

            if let Some(idx) = hit {
                return self.commit_allocation(inode_ref, bg_ref, bitmap_block, idx);
            }

            // Nothing found near the goal; release the untouched bitmap.
            if let Err(err) = self.block_set(&mut bitmap_block) {
                let _ = self.put_group_ref(&mut bg_ref);
                return Err(err);
            }
        }

        self.put_group_ref(&mut bg_ref)?;

        // Try other block groups, round-robin from the one after the goal.
        let group_count = self.sb.group_count();
        let mut bgid = (bgid + 1) % group_count;
        let mut remaining = group_count;

        while remaining > 0 {
            let mut bg_ref = self.get_group_ref(bgid)?;

            if bg_ref.desc.free_blocks_count == 0 {
                self.put_group_ref(&mut bg_ref)?;
                bgid = (bgid + 1) % group_count;
                remaining -= 1;
                continue;
            }

            let mut bitmap_block = match self.block_get(bg_ref.desc.bitmap_block) {
                Ok(block) => block,
                Err(err) => {
                    let _ = self.put_group_ref(&mut bg_ref);
                    return Err(err);
                }
            };

            let start = clamp_to_group_start(&self.sb, 0, bgid);
            let blocks_in_group = self.sb.blocks_in_group(bgid);

            if let Some(idx) = bitmap::find_first_clear(&bitmap_block.data, start, blocks_in_group)
            {
                return self.commit_allocation(inode_ref, bg_ref, bitmap_block, idx);
            }

            if let Err(err) = self.block_set(&mut bitmap_block) {
                let _ = self.put_group_ref(&mut bg_ref);
                return Err(err);
            }
            self.put_group_ref(&mut bg_ref)?;

            bgid = (bgid + 1) % group_count;
            remaining -= 1;
        }

        trace!("no free blocks left in any of {} groups", group_count);
        Err(FsError::OutOfSpace)
    }

    /// Marks bit `idx` of the group allocated, persists the bitmap, advances
    /// the counters, and releases the group reference. Shared tail of both
    /// allocator phases.
    fn commit_allocation(
        &mut self,
        inode_ref: &mut InodeRef,
        mut bg_ref: GroupRef,
        mut bitmap_block: crate::fs::Block,
        idx: u32,
    ) -> Result<u64, FsError> {
        bitmap::bit_set(&mut bitmap_block.data, idx);
        group::set_bitmap_checksum(&self.sb, &mut bg_ref.desc, &bitmap_block.data);
        bitmap_block.dirty = true;

        if let Err(err) = self.block_set(&mut bitmap_block) {
            let _ = self.put_group_ref(&mut bg_ref);
            return Err(err);
        }

        let allocated = index_in_group_to_block(&self.sb, idx, bg_ref.index);
        self.update_counters(inode_ref, &mut bg_ref, -1);
        self.put_group_ref(&mut bg_ref)?;

        trace!("allocated block {} from group {}", allocated, bg_ref.index);
        Ok(allocated)
    }

    /// Attempts to claim one specific block, never searching elsewhere.
    ///
    /// Returns whether the bit was free before the call. When it was, the
    /// block is now allocated and all counters advanced; when it was not,
    /// nothing changes and the caller must look elsewhere.
    pub fn try_alloc_block(
        &mut self,
        inode_ref: &mut InodeRef,
        baddr: u64,
    ) -> Result<bool, FsError> {
        let bgid = group_of_block(&self.sb, baddr);
        let index_in_group = block_to_index_in_group(&self.sb, baddr);

        let mut bg_ref = self.get_group_ref(bgid)?;

        let mut bitmap_block = match self.block_get(bg_ref.desc.bitmap_block) {
            Ok(block) => block,
            Err(err) => {
                let _ = self.put_group_ref(&mut bg_ref);
                return Err(err);
            }
        };

        let was_free = bitmap::bit_is_clear(&bitmap_block.data, index_in_group);
        if was_free {
            bitmap::bit_set(&mut bitmap_block.data, index_in_group);
            group::set_bitmap_checksum(&self.sb, &mut bg_ref.desc, &bitmap_block.data);
            bitmap_block.dirty = true;
        }

        // Released either way; a clean block makes this a no-op write.
        if let Err(err) = self.block_set(&mut bitmap_block) {
            let _ = self.put_group_ref(&mut bg_ref);
            return Err(err);
        }

        if was_free {
            self.update_counters(inode_ref, &mut bg_ref, -1);
        }
        self.put_group_ref(&mut bg_ref)?;
        Ok(was_free)
    }
}
