//! Device geometry: the immutable configuration a driver and a volume must
//! agree on before mount.

use core::fmt;

/// Immutable NAND device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total number of physical erase blocks on the device.
    pub num_device_blocks: u32,
    /// Number of pages per erase block.
    pub pages_per_block: u32,
    /// Main-area size in bytes.
    pub page_size: u32,
    /// Spare (OOB) area size in bytes. Must be at least 16.
    pub spare_size: u32,
    /// Upper bound on blocks NDM may retire (factory-bad + runtime-bad).
    pub max_bad_blocks: u32,
}

/// Reasons a [`Geometry`] can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// Spare area is smaller than the 16-byte on-media layout needs.
    SpareTooSmall,
    /// `pages_per_block` was zero.
    ZeroPagesPerBlock,
    /// `page_size` was zero.
    ZeroPageSize,
    /// Reserving two control blocks plus `max_bad_blocks` leaves no virtual
    /// blocks at all.
    DeviceTooSmall,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::SpareTooSmall => write!(f, "spare area must be at least 16 bytes"),
            GeometryError::ZeroPagesPerBlock => write!(f, "pages_per_block must be nonzero"),
            GeometryError::ZeroPageSize => write!(f, "page_size must be nonzero"),
            GeometryError::DeviceTooSmall => {
                write!(f, "device has no room for virtual blocks after reserving control blocks and bad-block headroom")
            }
        }
    }
}

impl std::error::Error for GeometryError {}

impl Geometry {
    /// Minimum spare-area size the on-media layout requires.
    pub const MIN_SPARE_SIZE: u32 = 16;

    /// Validate and construct a `Geometry`.
    pub fn new(
        num_device_blocks: u32,
        pages_per_block: u32,
        page_size: u32,
        spare_size: u32,
        max_bad_blocks: u32,
    ) -> Result<Self, GeometryError> {
        if spare_size < Self::MIN_SPARE_SIZE {
            return Err(GeometryError::SpareTooSmall);
        }
        if pages_per_block == 0 {
            return Err(GeometryError::ZeroPagesPerBlock);
        }
        if page_size == 0 {
            return Err(GeometryError::ZeroPageSize);
        }
        let geo = Geometry {
            num_device_blocks,
            pages_per_block,
            page_size,
            spare_size,
            max_bad_blocks,
        };
        if geo.num_virtual_blocks_capacity() == 0 {
            return Err(GeometryError::DeviceTooSmall);
        }
        Ok(geo)
    }

    /// Block size in bytes (`pages_per_block * page_size`).
    pub fn block_size(&self) -> u64 {
        self.pages_per_block as u64 * self.page_size as u64
    }

    /// Device blocks minus bad-block headroom minus the two reserved
    /// control blocks.
    pub fn num_virtual_blocks_capacity(&self) -> u32 {
        self.num_device_blocks
            .saturating_sub(self.max_bad_blocks)
            .saturating_sub(2)
    }

    /// First page number of the block containing `page`.
    pub fn block_first_page(&self, page: u32) -> u32 {
        (page / self.pages_per_block) * self.pages_per_block
    }

    /// Block number containing `page`.
    pub fn block_of_page(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    /// Offset of `page` within its block.
    pub fn page_offset_in_block(&self, page: u32) -> u32 {
        page % self.pages_per_block
    }

    /// First physical page of block `b`.
    pub fn first_page_of_block(&self, b: u32) -> u32 {
        b * self.pages_per_block
    }
}
