use anyhow::Result;
use candle_core::Device;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;

/// Resolves a device string: `cpu`, `auto`, `cuda` or `cuda:N`.
///
/// `auto` falls back to the CPU when no CUDA device can be opened.
pub fn select_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    match spec.as_str() {
        "cpu" => Ok(Device::Cpu),
        "auto" => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
        "cuda" | "gpu" => Ok(Device::new_cuda(0)?),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| anyhow::anyhow!("Unknown device '{}'", other))?;
            Ok(Device::new_cuda(ordinal)?)
        }
    }
}

/// Returns (free_memory, total_memory) in bytes for the specified device.
/// Returns (0, 0) if CUDA is not available or disabled.
pub fn get_vram_info(_device_id: usize) -> Result<(usize, usize)> {
    #[cfg(feature = "cuda")]
    {
        match CudaDevice::new(_device_id) {
            Ok(_dev) => {
                use cudarc::driver::result::mem_get_info;
                let (free, total) = mem_get_info()?;
                Ok((free, total))
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to initialize CUDA device {}: {:?}",
                    _device_id,
                    e
                );
                Ok((0, 0))
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        Ok((0, 0))
    }
}
