//! Accelerator selection with CPU fallback.

use candle_core::Device;
use tracing::{info, warn};

use crate::error::Result;

/// Upper bound on CUDA ordinals probed.
const MAX_PROBED_GPUS: usize = 16;

/// Outcome of reconciling the configured GPU count with the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuPlan {
    /// Ordinals of the accelerators to use, `0..n`.
    pub device_ids: Vec<usize>,
    /// Human-readable notes about any adjustment that was made.
    pub warnings: Vec<String>,
}

/// Clamps the requested accelerator count to what is available.
#[must_use]
pub fn clamp_gpu_count(requested: usize, available: usize) -> GpuPlan {
    let mut warnings = Vec::new();
    let mut use_gpus = requested;

    if use_gpus > 0 && available == 0 {
        warnings.push(
            "No GPU available on this machine, training will be performed on CPU.".to_string(),
        );
        use_gpus = 0;
    }
    if use_gpus > available {
        warnings.push(format!(
            "The number of GPU configured to use is {use_gpus}, but only {available} are available"
        ));
        use_gpus = available;
    }

    GpuPlan {
        device_ids: (0..use_gpus).collect(),
        warnings,
    }
}

/// Counts the CUDA devices candle can open.
#[must_use]
pub fn available_gpus() -> usize {
    if !candle_core::utils::cuda_is_available() {
        return 0;
    }
    (0..MAX_PROBED_GPUS)
        .take_while(|&ordinal| Device::new_cuda(ordinal).is_ok())
        .count()
}

/// Device chosen for the run plus the accelerator ordinals that were granted.
#[derive(Debug, Clone)]
pub struct PreparedDevice {
    pub device: Device,
    pub device_ids: Vec<usize>,
}

/// Picks the compute device for `requested` GPUs, falling back to the CPU.
///
/// Only the first granted accelerator performs computation.
pub fn prepare_device(requested: usize) -> Result<PreparedDevice> {
    let plan = clamp_gpu_count(requested, available_gpus());
    for message in &plan.warnings {
        warn!("{message}");
    }

    let device = match plan.device_ids.first() {
        Some(&ordinal) => Device::new_cuda(ordinal)?,
        None => Device::Cpu,
    };
    if plan.device_ids.len() > 1 {
        warn!(
            granted = plan.device_ids.len(),
            "data-parallel execution is not supported, using device 0 only"
        );
    }
    info!(device = ?device, "compute device prepared");

    Ok(PreparedDevice {
        device,
        device_ids: plan.device_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_gpu_falls_back_to_cpu() {
        let plan = clamp_gpu_count(2, 0);
        assert!(plan.device_ids.is_empty());
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("CPU"));
    }

    #[test]
    fn request_clamped_to_available() {
        let plan = clamp_gpu_count(4, 2);
        assert_eq!(plan.device_ids, vec![0, 1]);
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("only 2"));
    }

    #[test]
    fn never_exceeds_available() {
        for requested in 0..6 {
            for available in 0..6 {
                let plan = clamp_gpu_count(requested, available);
                assert!(plan.device_ids.len() <= available);
                assert!(plan.device_ids.len() <= requested);
            }
        }
    }

    #[test]
    fn satisfiable_request_has_no_warnings() {
        let plan = clamp_gpu_count(1, 3);
        assert_eq!(plan.device_ids, vec![0]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn zero_requested_uses_cpu() {
        let prepared = prepare_device(0).unwrap();
        assert!(prepared.device_ids.is_empty());
        assert!(matches!(prepared.device, Device::Cpu));
    }
}
