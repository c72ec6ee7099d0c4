//! Compute device selection for in-process decoding

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Device preference for the Candle backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Select a device, falling back to CPU when the accelerator is unavailable
///
/// Both model variants are loaded onto the device this returns, so a GPU
/// that fails to initialize degrades the whole harness to CPU rather than
/// failing startup.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => None,
        DevicePreference::Cuda | DevicePreference::Metal => {
            let device = accelerator(preference);
            if device.is_none() {
                tracing::warn!("{} requested but unavailable, using CPU", preference);
            }
            device
        }
        DevicePreference::Auto => {
            accelerator(DevicePreference::Cuda).or_else(|| accelerator(DevicePreference::Metal))
        }
    };

    let device = device.unwrap_or(Device::Cpu);
    tracing::info!("Selected device: {:?}", device);
    Ok(device)
}

/// Open GPU 0 of the given kind, if this build supports it
fn accelerator(kind: DevicePreference) -> Option<Device> {
    let opened = match kind {
        DevicePreference::Cuda => cuda_device()?,
        DevicePreference::Metal => metal_device()?,
        DevicePreference::Cpu | DevicePreference::Auto => return None,
    };

    opened
        .map_err(|e| tracing::warn!("{} initialization failed: {}", kind, e))
        .ok()
}

#[cfg(feature = "cuda")]
fn cuda_device() -> Option<candle_core::Result<Device>> {
    Some(Device::new_cuda(0))
}

#[cfg(not(feature = "cuda"))]
fn cuda_device() -> Option<candle_core::Result<Device>> {
    tracing::debug!("Built without cuda support");
    None
}

#[cfg(feature = "metal")]
fn metal_device() -> Option<candle_core::Result<Device>> {
    Some(Device::new_metal(0))
}

#[cfg(not(feature = "metal"))]
fn metal_device() -> Option<candle_core::Result<Device>> {
    tracing::debug!("Built without metal support");
    None
}
