//! NDM bad-block remap and the FTL-N log-structured translator it carries.
//!
//! Two internal layers (`ndm`, `ftln`) and one client-facing type
//! ([`volume::Volume`]) sitting on top of both. Everything here talks to
//! "hardware" only through [`ftl_driver::Driver`]; no module performs I/O on
//! its own.

pub mod config;
pub mod error;
pub mod ftln;
pub mod ndm;
pub mod volume;

pub use config::VolumeConfig;
pub use error::{FtlError, FtlResult, NdmError, NdmResult};
pub use ftln::stats::{Diagnosis, Stats};
pub use ndm::DriverCounters;
pub use volume::Volume;
