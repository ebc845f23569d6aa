//! Device and precision selection.

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Caller intent for device placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Picks the best available compute device for the given placement intent.
/// Deterministic for a fixed host configuration, no side effects.
pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            info!("no accelerator found, running on CPU; build with `--features metal` for GPU");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            info!("no accelerator found, running on CPU; build with `--features cuda` for GPU");
            Ok(Device::Cpu)
        }
    }
}

/// Numeric precision for tensor computation on the given device.
pub fn select_dtype(device: &Device) -> DType {
    device.bf16_default_to_f32()
}

/// Device class label for the status surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Mps,
}

serde_plain::derive_display_from_serialize!(DeviceKind);

/// Precision label for the status surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtypeKind {
    Fp16,
    Bf16,
    Fp32,
}

serde_plain::derive_display_from_serialize!(DtypeKind);

pub fn device_kind(device: &Device) -> DeviceKind {
    if device.is_cuda() {
        DeviceKind::Cuda
    } else if device.is_metal() {
        DeviceKind::Mps
    } else {
        DeviceKind::Cpu
    }
}

pub fn dtype_kind(dtype: DType) -> DtypeKind {
    match dtype {
        DType::F16 => DtypeKind::Fp16,
        DType::BF16 => DtypeKind::Bf16,
        _ => DtypeKind::Fp32,
    }
}
