//! Bitmap-based physical block allocator for a block-group filesystem.
//!
//! The volume is divided into fixed-size block groups, each tracked by one
//! bitmap block and a descriptor record. The allocator keeps three layers of
//! free-space accounting consistent on every mutation: the superblock's
//! global counter, the per-group descriptor counter, and the owning inode's
//! block count (measured in 512-byte units, not filesystem blocks).
//!
//! The design assumes a single actor mutating one mounted volume at a time;
//! callers needing concurrent access must serialize externally.

mod alloc;
mod bitmap;
mod fs;
mod group;
mod io;
mod node;
mod sb;

pub use crate::alloc::{
    block_to_index_in_group, group_first_block, group_of_block, index_in_group_to_block,
};
pub use crate::fs::{Block, Fs, FsError, MkfsOptions};
pub use crate::group::{set_bitmap_checksum, GroupDesc, GroupRef};
pub use crate::io::{BlockNumber, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
pub use crate::node::{Inode, InodeRef, INODE_BLOCK_SIZE};
pub use crate::sb::{
    IncompatFeatures, RoCompatFeatures, Superblock, GROUP_DESC_SIZE, GROUP_DESC_SIZE_MAX,
};
