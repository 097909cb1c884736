//! Retimes `.1` chart files for monitors that do not run at the game's
//! native frame rate.
//!
//! The game advances its clock by one timebase frame per vsync. On a
//! display running at a different rate the notes drift from the music, so
//! every event time is scaled by `refresh / timebase` as the chart is
//! loaded.
//!
//! Layout: a directory of 12 `(offset: u32, size: u32)` entries, each
//! pointing at a run of 8-byte events `(time: u32, kind: u8, param: u8,
//! value: u16)` terminated by `time == 0x7FFF_FFFF`. Little endian.

use crate::iohook::{
    Capability, DeviceDescriptor, DeviceEmulator, Handle, IoError, OpenParams, Opened, OsDevice,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub const TIMEBASE_9_TO_13: f64 = 59.94;
pub const TIMEBASE_14_TO_18_VGA: f64 = 60.046;

/// Rates closer than this to the timebase are left alone.
pub const REFRESH_TOLERANCE: f64 = 0.005;

pub const DIRECTORY_ENTRIES: usize = 12;
pub const DIRECTORY_LEN: usize = DIRECTORY_ENTRIES * 8;
pub const EVENT_LEN: usize = 8;
pub const END_OF_CHART: u32 = 0x7FFF_FFFF;

const READ_CHUNK: usize = 64 * 1024;

/// Measured display refresh rate, published by whoever measures it.
#[derive(Debug, Default)]
pub struct RefreshRate(AtomicU64);

impl RefreshRate {
    pub fn new(hz: Option<f64>) -> Self {
        let rate = Self::default();
        if let Some(hz) = hz {
            rate.set(hz);
        }
        rate
    }

    pub fn set(&self, hz: f64) {
        let bits = if hz.is_finite() && hz > 0.0 { hz.to_bits() } else { 0 };
        self.0.store(bits, Ordering::Release);
    }

    pub fn get(&self) -> Option<f64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

/// Scale every event time in `chart` by `factor`. Returns the number of
/// events rewritten; malformed directory entries are skipped.
pub fn patch_chart(chart: &mut [u8], factor: f64) -> usize {
    if chart.len() < DIRECTORY_LEN {
        return 0;
    }

    let mut patched = 0;
    for entry in 0..DIRECTORY_ENTRIES {
        let at = entry * 8;
        let offset = read_u32(chart, at) as usize;
        let size = read_u32(chart, at + 4) as usize;
        if size == 0 {
            continue;
        }

        let Some(end) = offset.checked_add(size).filter(|end| *end <= chart.len()) else {
            warn!("chart: directory entry {} out of bounds", entry);
            continue;
        };

        for event in (offset..end).step_by(EVENT_LEN) {
            if event + EVENT_LEN > end {
                break;
            }
            let time = read_u32(chart, event);
            if time == END_OF_CHART {
                break;
            }
            let scaled = (time as f64 * factor).round().min((END_OF_CHART - 1) as f64) as u32;
            chart[event..event + 4].copy_from_slice(&scaled.to_le_bytes());
            patched += 1;
        }
    }
    patched
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub struct ChartHandle {
    real: Handle,
    data: Vec<u8>,
    pos: usize,
}

impl ChartHandle {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

pub struct ChartPatch {
    timebase: f64,
    refresh: Arc<RefreshRate>,
}

impl ChartPatch {
    pub fn new(timebase: f64, refresh: Arc<RefreshRate>) -> Self {
        Self { timebase, refresh }
    }

    pub fn refresh_rate(&self) -> &Arc<RefreshRate> {
        &self.refresh
    }

    /// Time scale to apply, if the display is off the timebase.
    pub fn factor(&self) -> Option<f64> {
        let refresh = self.refresh.get()?;
        ((refresh - self.timebase).abs() >= REFRESH_TOLERANCE).then(|| refresh / self.timebase)
    }

    fn read_all(os: &dyn OsDevice, handle: Handle) -> Result<Vec<u8>, IoError> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = os.read(handle, &mut chunk)?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }
}

impl DeviceEmulator for ChartPatch {
    type State = ChartHandle;

    fn name(&self) -> &'static str {
        "chart-patch"
    }

    fn claims(&self, desc: &DeviceDescriptor) -> bool {
        desc.has(Capability::File) && desc.normalized_path().ends_with(".1") && self.factor().is_some()
    }

    fn open(
        &self,
        desc: &DeviceDescriptor,
        params: &OpenParams,
        os: &dyn OsDevice,
    ) -> Result<Opened<ChartHandle>, IoError> {
        let real = os.open(&desc.path, params)?;
        let mut data = match Self::read_all(os, real) {
            Ok(data) => data,
            Err(e) => {
                let _ = os.close(real);
                return Err(e);
            }
        };

        if let Some(factor) = self.factor() {
            let events = patch_chart(&mut data, factor);
            info!(
                "chart: {} retimed {} events (x{:.5})",
                desc.path, events, factor
            );
        }

        Ok(Opened::Owned(real, ChartHandle { real, data, pos: 0 }))
    }

    fn read(
        &self,
        state: &mut ChartHandle,
        _os: &dyn OsDevice,
        buf: &mut [u8],
    ) -> Result<usize, IoError> {
        let remaining = &state.data[state.pos.min(state.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        state.pos += n;
        Ok(n)
    }

    fn close(&self, state: ChartHandle, os: &dyn OsDevice) -> Result<(), IoError> {
        debug!("chart: closing handle {:#x}", state.real.0);
        os.close(state.real)
    }
}
