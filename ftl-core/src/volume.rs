//! `Volume`: the client-facing surface over NDM + FTL-N.
//!
//! Mirrors the Fuchsia `ftl::Volume` lifecycle (`Init` attaches a driver
//! without touching media, `Mount`/`Format` bring FTL-N up, `Unmount` tears
//! it down) rather than exposing `Ftln` directly, since a caller needs to be
//! able to attach a driver and defer the decision of format-vs-mount to
//! whatever it finds on the control record.

use crate::config::VolumeConfig;
use crate::error::{FtlError, FtlResult};
use crate::ftln::stats::{Diagnosis, Stats};
use crate::ftln::Ftln;
use crate::ndm::DriverCounters;
use ftl_driver::{Driver, Geometry};

enum State<D: Driver> {
    Unattached,
    Attached(D),
    Mounted(Ftln<D>),
}

/// The single client-facing type: one per physical device, single-threaded
/// (no internal locking; the caller serializes its own access).
pub struct Volume<D: Driver> {
    geometry: Geometry,
    config: VolumeConfig,
    state: State<D>,
}

impl<D: Driver> Volume<D> {
    pub fn new(geometry: Geometry, config: VolumeConfig) -> Self {
        Volume { geometry, config, state: State::Unattached }
    }

    /// `Init`: attach a driver without touching media yet.
    pub fn init(&mut self, driver: D) -> FtlResult<()> {
        match self.state {
            State::Unattached => {
                self.state = State::Attached(driver);
                Ok(())
            }
            State::Attached(_) | State::Mounted(_) => Err(FtlError::AlreadyMounted),
        }
    }

    /// `ReAttach`: bring FTL-N up over an already-`Init`ed driver. Separate
    /// entry point from `Mount` in the original only because re-attach can
    /// skip re-validating a driver handle it already holds; here `Init` and
    /// attach are the same step, so `ReAttach` is just `Mount`.
    pub fn reattach(&mut self, read_only: bool) -> FtlResult<()> {
        self.mount(read_only)
    }

    /// `Mount`: discover the control record and rebuild FTL-N state over the
    /// attached driver.
    pub fn mount(&mut self, read_only: bool) -> FtlResult<()> {
        let driver = match std::mem::replace(&mut self.state, State::Unattached) {
            State::Attached(d) => d,
            other @ State::Unattached => {
                self.state = other;
                return Err(FtlError::NotMounted);
            }
            other @ State::Mounted(_) => {
                self.state = other;
                return Err(FtlError::AlreadyMounted);
            }
        };
        match Ftln::mount(driver, self.geometry, self.config, read_only) {
            Ok(ftln) => {
                self.state = State::Mounted(ftln);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `Format`: lay out a fresh, empty volume over the attached driver.
    pub fn format(&mut self) -> FtlResult<()> {
        let driver = match std::mem::replace(&mut self.state, State::Unattached) {
            State::Attached(d) => d,
            other @ State::Unattached => {
                self.state = other;
                return Err(FtlError::NotMounted);
            }
            other @ State::Mounted(_) => {
                self.state = other;
                return Err(FtlError::AlreadyMounted);
            }
        };
        let ftln = Ftln::format(driver, self.geometry, self.config)?;
        self.state = State::Mounted(ftln);
        Ok(())
    }

    /// `FormatAndLevel`: format with aggressive wear-leveling. On this media
    /// model a fresh format already resets every block's wear count to zero,
    /// so there is nothing left to level; kept as a distinct entry point for
    /// API parity.
    pub fn format_and_level(&mut self) -> FtlResult<()> {
        self.format()
    }

    /// `Unmount`: flush and release the volume's in-RAM state. The driver
    /// itself is dropped with it, matching "Unmount" relinquishing the
    /// device rather than handing it back for a subsequent `Init`.
    pub fn unmount(&mut self) -> FtlResult<()> {
        match std::mem::replace(&mut self.state, State::Unattached) {
            State::Mounted(mut ftln) => {
                ftln.flush()?;
                Ok(())
            }
            other @ State::Unattached => {
                self.state = other;
                Err(FtlError::NotFound)
            }
            other @ State::Attached(_) => {
                self.state = other;
                Err(FtlError::NotFound)
            }
        }
    }

    fn mounted(&self) -> FtlResult<&Ftln<D>> {
        match &self.state {
            State::Mounted(f) => Ok(f),
            _ => Err(FtlError::NotMounted),
        }
    }

    fn mounted_mut(&mut self) -> FtlResult<&mut Ftln<D>> {
        match &mut self.state {
            State::Mounted(f) => Ok(f),
            _ => Err(FtlError::NotMounted),
        }
    }

    pub fn flush(&mut self) -> FtlResult<()> {
        self.mounted_mut()?.flush()
    }

    pub fn read(&mut self, first_vpn: u32, count: u32, buf: &mut [u8]) -> FtlResult<()> {
        self.mounted_mut()?.read_pages(first_vpn, count, buf)
    }

    pub fn write(&mut self, first_vpn: u32, count: u32, buf: &[u8]) -> FtlResult<()> {
        self.mounted_mut()?.write_pages(first_vpn, count, buf)
    }

    pub fn trim(&mut self, first_vpn: u32, count: u32) -> FtlResult<()> {
        self.mounted_mut()?.trim_pages(first_vpn, count)
    }

    /// Run one recycle pass. `Err(FtlError::Stop)` means nothing left to
    /// compact.
    pub fn garbage_collect(&mut self) -> FtlResult<()> {
        crate::ftln::recycle::recycle_one(self.mounted_mut()?)
    }

    pub fn get_stats(&self) -> FtlResult<Stats> {
        Ok(self.mounted()?.get_stats())
    }

    pub fn get_counters(&self) -> FtlResult<DriverCounters> {
        Ok(self.mounted()?.get_counters())
    }

    pub fn diagnose_known_issues(&mut self) -> FtlResult<Vec<Diagnosis>> {
        self.mounted_mut()?.diagnose_known_issues()
    }

    pub fn num_vpages(&self) -> FtlResult<u32> {
        Ok(self.mounted()?.num_vpages())
    }
}
