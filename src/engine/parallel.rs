//! Parallel loop driver.
//!
//! [`parallel_for`] fans a loop out over rayon the way a static-schedule
//! `parallel for` does: `0..iterations` is cut into contiguous chunks, and
//! every chunk runs on its own fresh thread context holding its own view of
//! the allocation. After the chunk's last iteration the view is exited (so
//! `CopyInOut` views reconcile) and the context is retired.
//!
//! ## Scheduling
//!
//! The number of chunks is [`ResidencyConfig::worker_chunks`], capped at the
//! iteration count. Chunks are independent; rayon decides which worker runs
//! which chunk.
//!
//! [`ResidencyConfig::worker_chunks`]: crate::config::ResidencyConfig::worker_chunks

use rayon::prelude::*;

use crate::engine::error::ResidencyResult;
use crate::engine::manager::ResidencyManager;
use crate::engine::registry::View;
use crate::engine::types::{AllocationID, ContextKind, DuplicationMode};
use crate::profiler;

/// Runs `body(manager, view, i)` for every `i` in `0..iterations`.
///
/// ## Errors
/// Every chunk runs to completion (or to its first failing iteration); the
/// error of the lowest-numbered failing chunk is returned.
pub fn parallel_for<F>(
    manager: &ResidencyManager,
    allocation: AllocationID,
    mode: DuplicationMode,
    iterations: usize,
    body: F,
) -> ResidencyResult<()>
where
    F: Fn(&ResidencyManager, &View, usize) -> ResidencyResult<()> + Send + Sync,
{
    if iterations == 0 {
        return Ok(());
    }
    let chunks = manager.config().worker_chunks.clamp(1, iterations);
    let chunk_len = iterations.div_ceil(chunks);

    let results: Vec<ResidencyResult<()>> = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let start = chunk * chunk_len;
            let end = (start + chunk_len).min(iterations);
            if start >= end {
                return Ok(());
            }
            if let Some(worker) = rayon::current_thread_index() {
                profiler::thread_name(format!("rayon-{worker}"));
            }
            let _span = profiler::span("parallel_for.chunk").arg("first", profiler::Arg::U64(start as u64));

            let context = manager.create_context(ContextKind::Thread)?;
            let view = match manager.enter_region(allocation, context.id, mode) {
                Ok(view) => view,
                Err(e) => {
                    let _ = manager.retire_context(context.id);
                    return Err(e);
                }
            };
            let ran = (start..end).try_for_each(|i| body(manager, &view, i));
            let exited = manager.exit_region(&view);
            if let Err(e) = &exited {
                tracing::warn!(view = view.id(), error = %e, "chunk exit failed; discarding view");
                if let Err(e) = manager.remove_view(&view) {
                    tracing::warn!(view = view.id(), error = %e, "failed to discard view");
                }
            }
            let retired = manager.retire_context(context.id);
            ran.and(exited).and(retired)
        })
        .collect();

    results.into_iter().collect()
}

impl ResidencyManager {
    /// See [`parallel_for`].
    pub fn parallel_for<F>(
        &self,
        allocation: AllocationID,
        mode: DuplicationMode,
        iterations: usize,
        body: F,
    ) -> ResidencyResult<()>
    where
        F: Fn(&ResidencyManager, &View, usize) -> ResidencyResult<()> + Send + Sync,
    {
        parallel_for(self, allocation, mode, iterations, body)
    }
}
