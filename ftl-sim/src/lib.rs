//! RAM-backed [`Driver`] with fault injection.
//!
//! Backing storage lives behind `Arc<Mutex<SimState>>` rather than being
//! owned outright by the driver value, so a test can hold its own handle
//! (clone) to the same media after handing one clone to a `Volume` —
//! exactly what scenario 6 ("crash mid-relocation... ReAttach") needs: the
//! test's handle calls [`SimDriver::simulate_restart`] and then mounts a
//! fresh clone against the same underlying bytes.

use ftl_driver::{BadBlockQuery, Driver, EraseResult, Geometry, PageNumber, ReadResult, WriteResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Fault-injection knobs controlling how the simulated media misbehaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultConfig {
    /// Every Nth `read_page` call returns `UnsafeEcc` (data is still filled
    /// correctly; it's a "getting weak" signal, not data loss).
    pub ecc_error_interval: Option<u64>,
    /// Every Nth `write_page` call triggers a new bad-block event.
    pub bad_block_interval: Option<u64>,
    /// Number of consecutive blocks marked bad by one bad-block event.
    pub bad_block_burst: u32,
    /// The Nth `write_page` call (counting from 1) triggers a simulated
    /// power failure: the write is torn (or dropped outright) and every
    /// subsequent driver call returns `Fatal` until [`SimDriver::simulate_restart`].
    pub power_failure_delay: Option<u64>,
    /// If set, a power-failure write lands its main-area data but not its
    /// spare area (a torn write, detectable via the validity marker). If
    /// unset, the write is dropped entirely (pure power loss before any
    /// bytes landed).
    pub emulate_half_write_on_power_failure: bool,
}

struct PageSlot {
    data: Vec<u8>,
    spare: Vec<u8>,
}

struct SimState {
    pages: Vec<PageSlot>,
    factory_bad: HashSet<u32>,
    runtime_bad: HashSet<u32>,
    erase_counts: Vec<u32>,
    faults: FaultConfig,
    write_calls: u64,
    read_calls: u64,
    erase_calls: u64,
    crashed: bool,
    one_shot_write_fail: Option<u32>,
    read_overrides: HashMap<u32, ReadResult>,
}

/// A RAM-backed NAND simulator. Cheap to [`Clone`]: clones share the same
/// backing media (an `Arc<Mutex<_>>`), matching how a real device's state
/// outlives any one process attached to it.
#[derive(Clone)]
pub struct SimDriver {
    geometry: Geometry,
    state: Arc<Mutex<SimState>>,
}

impl SimDriver {
    pub fn new(geometry: Geometry) -> Self {
        Self::with_factory_bad(geometry, &[])
    }

    pub fn with_factory_bad(geometry: Geometry, factory_bad: &[u32]) -> Self {
        let total_pages = geometry.num_device_blocks as usize * geometry.pages_per_block as usize;
        let pages = (0..total_pages)
            .map(|_| PageSlot {
                data: vec![0xFFu8; geometry.page_size as usize],
                spare: vec![0xFFu8; geometry.spare_size as usize],
            })
            .collect();
        SimDriver {
            geometry,
            state: Arc::new(Mutex::new(SimState {
                pages,
                factory_bad: factory_bad.iter().copied().collect(),
                runtime_bad: HashSet::new(),
                erase_counts: vec![0; geometry.num_device_blocks as usize],
                faults: FaultConfig::default(),
                write_calls: 0,
                read_calls: 0,
                erase_calls: 0,
                crashed: false,
                one_shot_write_fail: None,
                read_overrides: HashMap::new(),
            })),
        }
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.state.lock().unwrap().faults = faults;
    }

    /// Fail the very next write to physical page `pn` with `BlockFailed`,
    /// once.
    pub fn inject_write_failure_at(&self, pn: u32) {
        self.state.lock().unwrap().one_shot_write_fail = Some(pn);
    }

    /// Force every read of physical page `pn` to return `result` until
    /// [`Self::clear_read_override`] is called.
    pub fn inject_read_result_at(&self, pn: u32, result: ReadResult) {
        self.state.lock().unwrap().read_overrides.insert(pn, result);
    }

    pub fn clear_read_override(&self, pn: u32) {
        self.state.lock().unwrap().read_overrides.remove(&pn);
    }

    /// Clear the crashed-until-restart state a simulated power failure sets.
    /// Media contents (including a torn write) are left exactly as they were
    /// at the moment of the crash, matching a real device's behavior.
    pub fn simulate_restart(&self) {
        self.state.lock().unwrap().crashed = false;
    }

    pub fn write_call_count(&self) -> u64 {
        self.state.lock().unwrap().write_calls
    }

    pub fn read_call_count(&self) -> u64 {
        self.state.lock().unwrap().read_calls
    }

    pub fn erase_count_of(&self, block: u32) -> u32 {
        self.state.lock().unwrap().erase_counts[block as usize]
    }

    fn block_of(&self, pn: PageNumber) -> u32 {
        pn / self.geometry.pages_per_block
    }
}

impl Driver for SimDriver {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_page(&mut self, pn: PageNumber, data: Option<&mut [u8]>, spare: Option<&mut [u8]>) -> ReadResult {
        let mut st = self.state.lock().unwrap();
        if st.crashed {
            return ReadResult::Fatal;
        }
        st.read_calls += 1;
        let read_calls = st.read_calls;

        if let Some(buf) = data {
            buf.copy_from_slice(&st.pages[pn as usize].data);
        }
        if let Some(buf) = spare {
            buf.copy_from_slice(&st.pages[pn as usize].spare);
        }

        if let Some(&forced) = st.read_overrides.get(&pn) {
            log::warn!("ftl-sim: forced read result {forced:?} at pn {pn}");
            return forced;
        }
        if let Some(interval) = st.faults.ecc_error_interval {
            if interval > 0 && read_calls % interval == 0 {
                log::warn!("ftl-sim: injected unsafe_ecc at pn {pn} (read #{read_calls})");
                return ReadResult::UnsafeEcc;
            }
        }
        ReadResult::Ok
    }

    fn write_page(&mut self, pn: PageNumber, data: &[u8], spare: &[u8]) -> WriteResult {
        let mut st = self.state.lock().unwrap();
        if st.crashed {
            return WriteResult::Fatal;
        }
        st.write_calls += 1;
        let write_calls = st.write_calls;
        let block = self.block_of(pn);

        if st.runtime_bad.contains(&block) || st.factory_bad.contains(&block) {
            return WriteResult::BlockFailed;
        }

        if st.one_shot_write_fail == Some(pn) {
            st.one_shot_write_fail = None;
            log::warn!("ftl-sim: injected one-shot write failure at pn {pn}");
            return WriteResult::BlockFailed;
        }

        if let Some(delay) = st.faults.power_failure_delay {
            if write_calls == delay {
                let emulate_half = st.faults.emulate_half_write_on_power_failure;
                log::error!("ftl-sim: simulated power failure on write #{write_calls} (pn {pn})");
                if emulate_half {
                    let half = data.len() / 2;
                    st.pages[pn as usize].data[..half].copy_from_slice(&data[..half]);
                    // spare area is left untouched (all 0xFF): the write was
                    // torn before the spare landed.
                }
                st.crashed = true;
                return WriteResult::Fatal;
            }
        }

        if let Some(interval) = st.faults.bad_block_interval {
            if interval > 0 && write_calls % interval == 0 {
                let burst = st.faults.bad_block_burst.max(1);
                log::warn!("ftl-sim: bad-block event at write #{write_calls}, {burst} block(s) starting at {block}");
                for b in block..block + burst {
                    st.runtime_bad.insert(b);
                }
                return WriteResult::BlockFailed;
            }
        }

        st.pages[pn as usize].data.copy_from_slice(data);
        st.pages[pn as usize].spare.copy_from_slice(spare);
        WriteResult::Ok
    }

    fn erase_block(&mut self, first_page_of_block: PageNumber) -> EraseResult {
        let mut st = self.state.lock().unwrap();
        if st.crashed {
            return EraseResult::Fatal;
        }
        st.erase_calls += 1;
        let block = self.block_of(first_page_of_block);
        if st.runtime_bad.contains(&block) || st.factory_bad.contains(&block) {
            return EraseResult::BlockFailed;
        }
        let first = first_page_of_block as usize;
        let pages_per_block = self.geometry.pages_per_block as usize;
        for slot in &mut st.pages[first..first + pages_per_block] {
            slot.data.fill(0xFF);
            slot.spare.fill(0xFF);
        }
        st.erase_counts[block as usize] += 1;
        EraseResult::Ok
    }

    fn is_bad_block(&mut self, first_page_of_block: PageNumber) -> BadBlockQuery {
        let st = self.state.lock().unwrap();
        let block = self.block_of(first_page_of_block);
        if st.factory_bad.contains(&block) || st.runtime_bad.contains(&block) {
            BadBlockQuery::Bad
        } else {
            BadBlockQuery::Good
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_driver::Geometry;

    fn geometry() -> Geometry {
        Geometry::new(20, 4, 64, 16, 2).unwrap()
    }

    #[test]
    fn fresh_media_reads_as_erased() {
        let mut sim = SimDriver::new(geometry());
        let mut data = vec![0u8; 64];
        let mut spare = vec![0u8; 16];
        let result = sim.read_page(0, Some(&mut data), Some(&mut spare));
        assert_eq!(result, ReadResult::Ok);
        assert!(data.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut sim = SimDriver::new(geometry());
        let data = vec![0xABu8; 64];
        let spare = vec![0x11u8; 16];
        assert_eq!(sim.write_page(0, &data, &spare), WriteResult::Ok);
        let mut out_data = vec![0u8; 64];
        let mut out_spare = vec![0u8; 16];
        sim.read_page(0, Some(&mut out_data), Some(&mut out_spare));
        assert_eq!(out_data, data);
        assert_eq!(out_spare, spare);
    }

    #[test]
    fn bad_block_interval_fails_writes_and_marks_block() {
        let sim = SimDriver::new(geometry());
        sim.set_faults(FaultConfig { bad_block_interval: Some(1), bad_block_burst: 1, ..Default::default() });
        let mut driver = sim.clone();
        let result = driver.write_page(0, &[0u8; 64], &[0u8; 16]);
        assert_eq!(result, WriteResult::BlockFailed);
        assert_eq!(driver.is_bad_block(0), BadBlockQuery::Bad);
    }

    #[test]
    fn power_failure_tears_write_and_crashes_until_restart() {
        let sim = SimDriver::new(geometry());
        sim.set_faults(FaultConfig {
            power_failure_delay: Some(1),
            emulate_half_write_on_power_failure: true,
            ..Default::default()
        });
        let mut driver = sim.clone();
        let data = vec![0xAAu8; 64];
        let spare = vec![0xBBu8; 16];
        assert_eq!(driver.write_page(0, &data, &spare), WriteResult::Fatal);
        assert_eq!(driver.read_page(0, None, None), ReadResult::Fatal);
        sim.simulate_restart();
        let mut out_data = vec![0u8; 64];
        let mut out_spare = vec![0u8; 16];
        assert_eq!(driver.read_page(0, Some(&mut out_data), Some(&mut out_spare)), ReadResult::Ok);
        assert_eq!(&out_data[..32], &data[..32]);
        assert!(out_spare.iter().all(|&b| b == 0xFF));
    }
}
