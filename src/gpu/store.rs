//! wgpu-backed device address space.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::engine::error::MemoryError;
use crate::engine::memory::BackingStore;
use crate::engine::types::{Address, AddressSpace, BLOCK_ALIGN, DEVICE_BASE};
use crate::gpu::context::{backend, GPUContext};

const COPY_ALIGN: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

#[inline]
fn align_down(n: usize) -> usize {
    n & !(COPY_ALIGN - 1)
}

#[inline]
fn align_up(n: usize) -> usize {
    (n + COPY_ALIGN - 1) & !(COPY_ALIGN - 1)
}

struct GpuBlock {
    buffer: wgpu::Buffer,
    len: usize,
}

struct WgpuState {
    blocks: BTreeMap<u64, GpuBlock>,
    next: u64,
    live_bytes: usize,
}

/// Device store whose blocks are wgpu storage buffers.
pub struct WgpuMemory {
    context: GPUContext,
    capacity: usize,
    state: Mutex<WgpuState>,
}

impl WgpuMemory {
    /// Opens the default adapter. A `capacity` of `0` means unlimited.
    pub fn open(capacity: usize) -> Result<Self, MemoryError> {
        Ok(Self::with_context(GPUContext::new()?, capacity))
    }

    /// Uses an already opened device.
    pub fn with_context(context: GPUContext, capacity: usize) -> Self {
        Self {
            context,
            capacity,
            state: Mutex::new(WgpuState { blocks: BTreeMap::new(), next: DEVICE_BASE, live_bytes: 0 }),
        }
    }

    /// Device and queue.
    #[inline]
    pub fn context(&self) -> &GPUContext {
        &self.context
    }

    fn locate(state: &WgpuState, address: Address) -> Result<(u64, usize), MemoryError> {
        if address.space() != AddressSpace::Device {
            return Err(MemoryError::ForeignAddress { address, store: AddressSpace::Device });
        }
        let (&base, block) = state
            .blocks
            .range(..=address.raw())
            .next_back()
            .ok_or(MemoryError::UnknownAddress { address })?;
        let offset = (address.raw() - base) as usize;
        if offset >= block.len {
            return Err(MemoryError::UnknownAddress { address });
        }
        Ok((base, offset))
    }

    /// Copies `len` bytes at `start` out of `buffer`; both must be aligned.
    fn read_aligned(&self, buffer: &wgpu::Buffer, start: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let device = &self.context.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("residency.readback"),
            size: len as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("residency.readback"),
        });
        encoder.copy_buffer_to_buffer(buffer, start as u64, &staging, 0, len as u64);
        let submission = self.context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait { submission_index: Some(submission), timeout: None })
            .map_err(|e| backend("device poll", e))?;
        rx.recv()
            .map_err(|e| backend("map_async", e))?
            .map_err(|e| backend("map_async", e))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

impl BackingStore for WgpuMemory {
    fn space(&self) -> AddressSpace {
        AddressSpace::Device
    }

    fn label(&self) -> &'static str {
        "wgpu"
    }

    fn raw_alloc(&self, bytes: usize) -> Result<Address, MemoryError> {
        let padded = align_up(bytes.max(1));
        let mut state = self.state.lock();
        if self.capacity != 0 && state.live_bytes + padded > self.capacity {
            return Err(MemoryError::OutOfMemory {
                requested: bytes,
                available: self.capacity.saturating_sub(state.live_bytes),
            });
        }

        // Buffers are zero-initialized by wgpu.
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("residency.block"),
            size: padded as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let base = state.next;
        state.next = base + ((padded as u64 + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1));
        state.blocks.insert(base, GpuBlock { buffer, len: bytes.max(1) });
        state.live_bytes += padded;
        Ok(Address::from_raw(base))
    }

    fn raw_free(&self, address: Address) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let (base, offset) = Self::locate(&state, address)?;
        if offset != 0 {
            return Err(MemoryError::NotBlockBase { address });
        }
        if let Some(block) = state.blocks.remove(&base) {
            state.live_bytes -= align_up(block.len);
            block.buffer.destroy();
        }
        Ok(())
    }

    fn read(&self, src: Address, out: &mut [u8]) -> Result<(), MemoryError> {
        if out.is_empty() {
            return Ok(());
        }
        let state = self.state.lock();
        let (base, offset) = Self::locate(&state, src)?;
        let block = &state.blocks[&base];
        let available = block.len - offset;
        if out.len() > available {
            return Err(MemoryError::OutOfBounds { address: src, bytes: out.len(), available });
        }

        let start = align_down(offset);
        let end = align_up(offset + out.len());
        let span = self.read_aligned(&block.buffer, start, end - start)?;
        out.copy_from_slice(&span[offset - start..offset - start + out.len()]);
        Ok(())
    }

    fn write(&self, dst: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let state = self.state.lock();
        let (base, offset) = Self::locate(&state, dst)?;
        let block = &state.blocks[&base];
        let available = block.len - offset;
        if bytes.len() > available {
            return Err(MemoryError::OutOfBounds { address: dst, bytes: bytes.len(), available });
        }

        let start = align_down(offset);
        let end = align_up(offset + bytes.len());
        if start == offset && end == offset + bytes.len() {
            self.context.queue.write_buffer(&block.buffer, offset as u64, bytes);
        } else {
            let mut span = self.read_aligned(&block.buffer, start, end - start)?;
            span[offset - start..offset - start + bytes.len()].copy_from_slice(bytes);
            self.context.queue.write_buffer(&block.buffer, start as u64, &span);
        }
        self.context.queue.submit(std::iter::empty());
        Ok(())
    }

    fn live_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }
}
