//! NAND driver trait and on-media spare-area layout.
//!
//! This crate is the seam between the FTL core (`ftl-core`) and whatever
//! actually owns the NAND chip. It defines:
//!
//! - [`Driver`], the five operations a NAND driver must provide.
//! - [`Geometry`], the immutable device shape both sides agree on.
//! - [`spare`], the byte-accurate on-media layout of the 16+ byte spare
//!   (out-of-band) area that NDM and FTL-N pack their metadata into.
//!
//! Implementations include the production NAND driver (out of scope for
//! this crate) and `ftl-sim`'s RAM-backed simulator used in tests.

pub mod geometry;
pub mod spare;

pub use geometry::Geometry;

/// Absolute physical page number.
pub type PageNumber = u32;

/// Absolute physical (or virtual, depending on context) block number.
pub type BlockNumber = u32;

/// Result of a page read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// Data (and spare, if requested) read back clean.
    Ok,
    /// Correctable, but the block is nearing its ECC limit and should be
    /// recycled soon.
    UnsafeEcc,
    /// Data could not be recovered.
    Uncorrectable,
    /// Unrecoverable I/O failure (bus error, disconnected media).
    Fatal,
}

/// Result of a page write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Ok,
    /// The write failed in a way that indicates the block itself is bad.
    BlockFailed,
    Fatal,
}

/// Result of a block erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseResult {
    Ok,
    BlockFailed,
    Fatal,
}

/// Result of a bad-block query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadBlockQuery {
    Good,
    Bad,
    /// The query itself failed (treated as fatal by callers).
    Error,
}

/// A NAND driver: byte-accurate page I/O with out-of-band spare bytes and
/// ECC results. The core never performs I/O outside of calls to this trait.
///
/// Implementations own ECC encoding/decoding of main and spare areas. Byte 0
/// of the spare area is the driver's bad-block mark; the core never writes
/// it (see [`spare`]).
pub trait Driver: Send {
    /// Device geometry this driver was configured with.
    fn geometry(&self) -> &Geometry;

    /// Read a page. Either buffer may be `None` if the caller only needs
    /// the other one (e.g. a spare-only scan during mount).
    fn read_page(
        &mut self,
        pn: PageNumber,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> ReadResult;

    /// Write a full page plus spare.
    fn write_page(&mut self, pn: PageNumber, data: &[u8], spare: &[u8]) -> WriteResult;

    /// Erase the block containing `first_page_of_block`.
    fn erase_block(&mut self, first_page_of_block: PageNumber) -> EraseResult;

    /// Query the driver's persistent bad-block mark for the block containing
    /// `first_page_of_block`. This is independent of NDM's own bad-block
    /// bookkeeping: it is how NDM discovers blocks bad at the factory.
    fn is_bad_block(&mut self, first_page_of_block: PageNumber) -> BadBlockQuery;

    /// True if `data`/`spare` look like an erased (all-0xFF), never-written
    /// page rather than one holding valid content.
    fn is_empty_page(&self, data: &[u8], spare: &[u8]) -> bool {
        data.iter().all(|&b| b == 0xFF) && spare.iter().all(|&b| b == 0xFF)
    }

    /// MLC page-pair companion offset within a block. Single-level-cell
    /// drivers never call this; it exists only for MLC-aware drivers and is
    /// not otherwise used by the core.
    fn pair_offset(&self, page_offset: u32) -> u32 {
        page_offset
    }

    /// Native copy-in-place transfer, if the driver can do better than
    /// read-into-scratch/write-from-scratch. The default falls back to that
    /// two-step form; `new_spare` (not `old_spare`) is what must land on
    /// media.
    fn transfer_page(
        &mut self,
        old_pn: PageNumber,
        new_pn: PageNumber,
        scratch_data: &mut [u8],
        new_spare: &[u8],
    ) -> Result<WriteResult, ReadResult> {
        match self.read_page(old_pn, Some(scratch_data), None) {
            ReadResult::Ok | ReadResult::UnsafeEcc => {}
            other => return Err(other),
        }
        Ok(self.write_page(new_pn, scratch_data, new_spare))
    }
}
