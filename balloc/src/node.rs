use zerocopy::{AsBytes, FromBytes};

/// The fixed accounting unit of the inode `blocks_count` field. Inodes count
/// owned storage in 512-byte units regardless of the filesystem block size,
/// so one filesystem block costs `block_size / INODE_BLOCK_SIZE` units.
pub const INODE_BLOCK_SIZE: u32 = 512;

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
/// This structure __must not exceed 256 bytes.__
pub struct Inode {
    /// The file mode (e.g full access - drwxrwxrwx).
    pub mode: u16,
    /// The id of the owning user.
    pub uid: u16,
    /// The id of the owning group.
    pub gid: u16,
    /// The number of links to this file.
    pub links_count: u16,
    /// The total size of the file in bytes.
    pub size: u64,
    /// Owned storage in `INODE_BLOCK_SIZE` units, not filesystem blocks.
    blocks_count: u32,
    /// The time the file was created in seconds since epoch.
    pub create_time: u32,
    /// The time the file was last updated in seconds since epoch.
    pub update_time: u32,
    /// The time the file was last accessed in seconds since epoch.
    pub access_time: u32,
    /// Pointers for the data blocks that belong to the file.
    pub block: [u32; 15],
    /// Reserved for future expansion of file attributes up to the 256 byte limit.
    padding: [u32; 41],
}

impl Inode {
    pub fn new() -> Self {
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            links_count: 0,
            size: 0,
            blocks_count: 0,
            create_time: 0,
            update_time: 0,
            access_time: 0,
            block: [0; 15],
            padding: [0; 41],
        }
    }

    pub fn blocks_count(&self) -> u32 {
        self.blocks_count
    }

    pub fn set_blocks_count(&mut self, count: u32) {
        self.blocks_count = count;
    }
}

/// The inode owning the blocks being allocated or freed. Passed in by the
/// caller and outliving the operation; the allocator only adjusts the block
/// accounting and flags the reference dirty for the caller to persist.
pub struct InodeRef {
    pub inode: Inode,
    pub index: u32,
    pub dirty: bool,
}

impl InodeRef {
    pub fn new(index: u32) -> Self {
        Self {
            inode: Inode::new(),
            index,
            dirty: false,
        }
    }
}
