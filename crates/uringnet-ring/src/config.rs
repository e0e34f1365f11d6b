//! Ring configuration as reported by the kernel.

use crate::sys::{self, Features, RingParams};

/// The kernel's answer to ring creation: actual queue capacities, ring
/// layout offsets, and feature flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingConfig {
    params: RingParams,
}

impl RingConfig {
    pub fn new(params: RingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RingParams {
        &self.params
    }

    pub fn submission_queue_capacity(&self) -> u32 {
        self.params.sq_entries
    }

    pub fn completion_queue_capacity(&self) -> u32 {
        self.params.cq_entries
    }

    pub fn features(&self) -> Features {
        Features::from_bits_truncate(self.params.features)
    }

    /// Byte length of the submission ring region (through the index
    /// array).
    pub fn submission_ring_length(&self) -> usize {
        self.params.sq_off.array as usize
            + self.params.sq_entries as usize * std::mem::size_of::<u32>()
    }

    /// Byte length of the submission entry array region.
    pub fn submission_array_length(&self) -> usize {
        self.params.sq_entries as usize * crate::submission::SUBMISSION_SIZE
    }

    /// Byte length of the completion ring region (through the CQE
    /// array).
    pub fn completion_ring_length(&self) -> usize {
        self.params.cq_off.cqes as usize
            + self.params.cq_entries as usize * crate::completion::COMPLETION_SIZE
    }

    /// True when the kernel never drops completions on queue overflow.
    pub fn supports_completion_queue_overflow(&self) -> bool {
        self.features().contains(Features::NODROP)
    }

    /// True when `io_uring_enter` accepts an extended-argument deadline.
    pub fn supports_enter_timeout(&self) -> bool {
        self.features().contains(Features::EXT_ARG)
    }

    /// True when async helpers run as native kernel workers.
    pub fn supports_native_workers(&self) -> bool {
        self.features().contains(Features::NATIVE_WORKERS)
    }

    /// True when both rings plus the index array share one mapping.
    pub fn supports_single_mmap(&self) -> bool {
        self.features().contains(Features::SINGLE_MMAP)
    }
}

/// Capability summary carried by the device after construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingCapabilities {
    /// Kernel honors `ASYNC_CANCEL` with `CANCEL_FD | CANCEL_ALL`
    /// (kernel ≥ 5.19).
    pub cancel_by_handle: bool,
}

impl RingCapabilities {
    pub fn detect() -> Self {
        let cancel_by_handle = match sys::kernel_version() {
            Some((major, minor)) => (major, minor) >= (5, 19),
            None => false,
        };
        Self { cancel_by_handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_queries() {
        let mut params = RingParams::default();
        params.features = (Features::NODROP | Features::EXT_ARG).bits();
        let config = RingConfig::new(params);
        assert!(config.supports_completion_queue_overflow());
        assert!(config.supports_enter_timeout());
        assert!(!config.supports_native_workers());
    }

    #[test]
    fn test_ring_lengths() {
        let mut params = RingParams::default();
        params.sq_entries = 8;
        params.cq_entries = 16;
        params.sq_off.array = 128;
        params.cq_off.cqes = 64;
        let config = RingConfig::new(params);
        assert_eq!(config.submission_ring_length(), 128 + 8 * 4);
        assert_eq!(config.submission_array_length(), 8 * 64);
        assert_eq!(config.completion_ring_length(), 64 + 16 * 16);
    }
}
