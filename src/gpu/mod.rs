//! # GPU Device Store
//!
//! A [`BackingStore`](crate::engine::memory::BackingStore) whose device
//! address space lives in `wgpu` buffers on a real adapter. Enabled with the
//! `gpu` feature and selected with `DeviceBackend::Wgpu`.
//!
//! ## Mapping
//!
//! * `raw_alloc` creates one storage buffer per block and hands out a tagged
//!   device address for it, exactly like the simulated arena.
//! * `write` goes through `Queue::write_buffer`.
//! * `read` copies into a `MAP_READ` staging buffer, submits, and waits with
//!   `Device::poll` before mapping.
//!
//! wgpu requires copies to be 4-byte aligned. Blocks are padded to a multiple
//! of 4, and unaligned accesses are widened to the enclosing aligned span
//! (writes become read-modify-write).
//!
//! ## Synchronization
//!
//! Every read blocks until the GPU has finished the copy. Nothing is ever
//! synchronized implicitly.

mod context;
mod store;

pub use context::GPUContext;
pub use store::WgpuMemory;
