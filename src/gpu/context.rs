//! Adapter, device and queue initialization.

use crate::engine::error::MemoryError;

/// Opened wgpu device and its queue.
pub struct GPUContext {
    /// Logical device.
    pub device: wgpu::Device,
    /// Submission queue.
    pub queue: wgpu::Queue,
}

impl GPUContext {
    /// Opens the default high-performance adapter.
    pub fn new() -> Result<Self, MemoryError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, MemoryError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| backend("request_adapter", e))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("residency.device"),
                ..Default::default()
            })
            .await
            .map_err(|e| backend("request_device", e))?;

        tracing::debug!(adapter = ?adapter.get_info().name, "opened wgpu device");
        Ok(Self { device, queue })
    }
}

pub(crate) fn backend(what: &'static str, detail: impl std::fmt::Debug) -> MemoryError {
    MemoryError::Backend { message: format!("{what}: {detail:?}").into() }
}
