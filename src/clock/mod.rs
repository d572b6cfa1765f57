use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device clock window recorded by the runtime around one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAlignment {
    pub device_start_cycle: u64,
    pub device_end_cycle: u64,
    pub host_start_ns: u64,
    pub host_end_ns: u64,
}

impl DeviceAlignment {
    /// Both end values are populated and the window is non-empty.
    pub fn is_complete(&self) -> bool {
        self.device_end_cycle != 0
            && self.host_end_ns != 0
            && self.device_end_cycle > self.device_start_cycle
    }
}

/// Errors returned when alignment data is unusable.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClockError {
    #[error("no alignment recorded for device {device}")]
    MissingAlignment { device: u32 },

    #[error("alignment for device {device} has no end values")]
    IncompleteAlignment { device: u32 },
}

/// Subtract `start` from `raw`, wrapping below zero to the top of the range.
#[inline]
pub fn rebias_cycle(start: u64, raw: u64) -> u64 {
    if raw >= start {
        raw - start
    } else {
        u64::MAX - (start - raw)
    }
}

/// Converts device-relative cycle counts into device-aligned and host time.
#[derive(Debug, Clone, Default)]
pub struct ClockAligner {
    devices: BTreeMap<u32, DeviceAlignment>,
}

impl ClockAligner {
    pub fn new(devices: BTreeMap<u32, DeviceAlignment>) -> Self {
        Self { devices }
    }

    pub fn insert(&mut self, device: u32, alignment: DeviceAlignment) {
        self.devices.insert(device, alignment);
    }

    pub fn get(&self, device: u32) -> Option<&DeviceAlignment> {
        self.devices.get(&device)
    }

    pub fn devices(&self) -> &BTreeMap<u32, DeviceAlignment> {
        &self.devices
    }

    /// Cycle count relative to the device's recorded start cycle.
    pub fn rebias(&self, device: u32, raw_cycle: u64) -> Result<u64, ClockError> {
        let alignment = self
            .devices
            .get(&device)
            .ok_or(ClockError::MissingAlignment { device })?;
        Ok(rebias_cycle(alignment.device_start_cycle, raw_cycle))
    }

    /// Host nanoseconds for an aligned cycle, interpolated over the device window.
    pub fn to_host_time(&self, device: u32, aligned_cycle: u64) -> Result<u64, ClockError> {
        let a = self
            .devices
            .get(&device)
            .ok_or(ClockError::MissingAlignment { device })?;
        if !a.is_complete() {
            return Err(ClockError::IncompleteAlignment { device });
        }

        let host_span = u128::from(a.host_end_ns.saturating_sub(a.host_start_ns));
        let device_span = u128::from(a.device_end_cycle - a.device_start_cycle);
        let offset = host_span * u128::from(aligned_cycle) / device_span;

        Ok(a.host_start_ns
            .saturating_add(u64::try_from(offset).unwrap_or(u64::MAX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_devices() -> ClockAligner {
        let mut aligner = ClockAligner::default();
        aligner.insert(
            1,
            DeviceAlignment {
                device_start_cycle: 0,
                device_end_cycle: 1000,
                host_start_ns: 0,
                host_end_ns: 1_000_000,
            },
        );
        aligner.insert(
            2,
            DeviceAlignment {
                device_start_cycle: 500,
                device_end_cycle: 1500,
                host_start_ns: 0,
                host_end_ns: 1_000_000,
            },
        );
        aligner
    }

    #[test]
    fn test_two_device_alignment() {
        let aligner = two_devices();
        let aligned = aligner.rebias(2, 700).expect("rebias");
        assert_eq!(aligned, 200);
        assert_eq!(aligner.to_host_time(2, aligned).expect("host time"), 200_000);
        assert_eq!(aligner.rebias(1, 700).expect("rebias"), 700);
    }

    #[test]
    fn test_rebias_start_is_zero() {
        let aligner = two_devices();
        assert_eq!(aligner.rebias(2, 500).expect("rebias"), 0);
        assert_eq!(aligner.to_host_time(2, 0).expect("host time"), 0);
    }

    #[test]
    fn test_rebias_monotonic_except_wrap() {
        let start = 1_000;
        let mut prev = rebias_cycle(start, start);
        for raw in start + 1..start + 100 {
            let v = rebias_cycle(start, raw);
            assert!(v >= prev);
            prev = v;
        }

        // Below the start wraps to the top of the range without underflow.
        assert_eq!(rebias_cycle(start, 999), u64::MAX - 1);
        assert_eq!(rebias_cycle(start, 0), u64::MAX - 1000);
        assert!(rebias_cycle(start, 998) < rebias_cycle(start, 999));
    }

    #[test]
    fn test_missing_alignment() {
        let aligner = two_devices();
        assert_eq!(
            aligner.rebias(7, 10),
            Err(ClockError::MissingAlignment { device: 7 })
        );
    }

    #[test]
    fn test_incomplete_alignment() {
        let mut aligner = ClockAligner::default();
        aligner.insert(
            0,
            DeviceAlignment {
                device_start_cycle: 10,
                ..Default::default()
            },
        );
        assert_eq!(aligner.rebias(0, 15), Ok(5));
        assert_eq!(
            aligner.to_host_time(0, 5),
            Err(ClockError::IncompleteAlignment { device: 0 })
        );
    }
}
