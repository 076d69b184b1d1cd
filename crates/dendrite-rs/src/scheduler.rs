//! Worker threads, round-robin dispatch, and the parallel update loop.
//!
//! Each device owns one worker spinning on a single-slot mailbox. The main
//! thread is the sole submitter and the sole consumer of completion; awaiting
//! a device spin-waits until its slot clears. A worker that fails poisons its
//! device and the current step errors out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};

use crate::backend::{Backend, Context, Device, Routine};
use crate::indexing::Bindings;
use crate::llir::Binop;
use crate::tensor::Tensor;

type Task = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// A single-slot spin mailbox executed by a dedicated worker thread.
pub struct WorkerQueue {
    slot: Mutex<Option<Task>>,
    busy: AtomicBool,
    keep_spinning: AtomicBool,
    poison: Mutex<Option<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerQueue {
    /// Spawns the worker thread and returns its mailbox.
    pub fn spawn(name: String) -> Arc<WorkerQueue> {
        let queue = Arc::new(WorkerQueue {
            slot: Mutex::new(None),
            busy: AtomicBool::new(false),
            keep_spinning: AtomicBool::new(true),
            poison: Mutex::new(None),
            handle: Mutex::new(None),
        });
        let worker = queue.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run_loop())
            .expect("spawning a device worker thread");
        *queue.handle.lock().unwrap() = Some(handle);
        queue
    }

    fn run_loop(&self) {
        while self.keep_spinning.load(Ordering::Acquire) {
            if self.busy.load(Ordering::Acquire) {
                let task = self.slot.lock().unwrap().take();
                if let Some(task) = task {
                    if let Err(e) = task() {
                        warn!("device worker failed: {e:#}");
                        *self.poison.lock().unwrap() = Some(format!("{e:#}"));
                        self.keep_spinning.store(false, Ordering::Release);
                    }
                }
                self.busy.store(false, Ordering::Release);
            } else {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }

    fn check_poison(&self) -> Result<()> {
        if let Some(msg) = self.poison.lock().unwrap().clone() {
            bail!("device poisoned: {msg}");
        }
        Ok(())
    }

    /// Installs a task; spins while a previous task is still in flight.
    pub fn submit(&self, task: Task) -> Result<()> {
        while self.busy.load(Ordering::Acquire) {
            self.check_poison()?;
            std::hint::spin_loop();
        }
        self.check_poison()?;
        *self.slot.lock().unwrap() = Some(task);
        self.busy.store(true, Ordering::Release);
        Ok(())
    }

    /// Spin-waits until the slot is clear.
    pub fn await_idle(&self) -> Result<()> {
        while self.busy.load(Ordering::Acquire) {
            self.check_poison()?;
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        self.check_poison()
    }

    /// Cooperative shutdown: stop spinning and join the worker.
    pub fn shutdown(&self) {
        self.keep_spinning.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Iterates the Cartesian product of all ranged bindings, calling `f` with
/// the running position. Bindings without ranges retain their values.
/// Returns the number of combinations visited.
pub fn round_robin(bindings: &Bindings, mut f: impl FnMut(usize) -> Result<()>) -> Result<usize> {
    let ranged: Vec<_> = bindings.iter().filter(|b| b.range.is_some()).collect();
    let total: usize = ranged.iter().map(|b| b.range.unwrap()).product();
    if ranged.iter().any(|b| b.range == Some(0)) {
        return Ok(0);
    }
    for pos in 0..total {
        // The last ranged binding advances fastest.
        let mut rest = pos;
        for b in ranged.iter().rev() {
            let r = b.range.unwrap();
            b.set((rest % r) as i64);
            rest /= r;
        }
        f(pos)?;
    }
    Ok(total)
}

/// The devices a parallel update will use: `min(available, requested)`,
/// in ordinal order.
pub fn take_devices(
    backend: &Arc<dyn Backend>,
    requested: usize,
) -> Result<Vec<Arc<dyn Device>>> {
    let n = backend.num_devices().min(requested);
    (0..n).map(|ordinal| backend.get_device(ordinal)).collect()
}

/// The pairwise-halving reduction schedule for `k` participants:
/// `(from, to)` pairs in execution order, ending at device 0.
pub fn merge_tree_pairs(k: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut count = k;
    while count > 1 {
        let half = count.div_ceil(2);
        for i in 0..count - half {
            pairs.push((i + half, i));
        }
        count = half;
    }
    pairs
}

/// Everything the round-robin parallel update needs, pre-compiled.
pub struct ParallelUpdate {
    pub backend: Arc<dyn Backend>,
    /// One context per participating device; context 0 is authoritative.
    pub ctxs: Vec<Arc<dyn Context>>,
    /// The gradient-update routine compiled once per context.
    pub grad_updates: Vec<Arc<dyn Routine>>,
    /// The optimizer step, compiled on context 0.
    pub sgd_update: Arc<dyn Routine>,
    pub loss_value: Tensor,
    pub param_values: Vec<Tensor>,
    pub param_grads: Vec<Tensor>,
    /// Iterated bindings; the device ordinal is `pos mod N`.
    pub bindings: Bindings,
}

struct MergeKernels {
    /// Cached per (to, from): loss merge then gradient merges.
    grads: Vec<Arc<dyn Routine>>,
}

/// Runs the round-robin parallel update over all binding combinations.
///
/// After every synchronization with `k` participating devices: gradients are
/// summed into device 0 through the merge tree, `sgd_update` runs on device
/// 0, parameters broadcast back to devices `1..k-1`, and `post_sync(k)` is
/// called.
pub fn parallel_update(
    setup: &ParallelUpdate,
    mut post_sync: impl FnMut(usize) -> Result<()>,
) -> Result<()> {
    let n = setup.ctxs.len();
    if n == 0 || setup.grad_updates.len() != n {
        bail!(
            "parallel update over {} contexts with {} gradient routines",
            n,
            setup.grad_updates.len()
        );
    }

    // Occupancy dry run: which sync points occur, with how many devices.
    let total = round_robin(&setup.bindings, |_| Ok(()))?;
    if total == 0 {
        return Ok(());
    }
    let mut sync_sizes = HashSet::new();
    sync_sizes.insert(n.min(total));
    if total % n != 0 {
        sync_sizes.insert(total % n);
    }
    let mut needed_pairs: Vec<(usize, usize)> = Vec::new();
    for &k in &sync_sizes {
        for pair in merge_tree_pairs(k) {
            if !needed_pairs.contains(&pair) {
                needed_pairs.push(pair);
            }
        }
    }

    // Pre-compile the gradient (and loss) merges per needed pair.
    let mut merges: Vec<((usize, usize), MergeKernels)> = Vec::new();
    for &(from, to) in &needed_pairs {
        let mut grads = Vec::new();
        let mut tensors = vec![setup.loss_value];
        tensors.extend(setup.param_grads.iter().copied());
        for g in tensors {
            let suffix = format!("_merge_d{to}_d{from}");
            let routine = setup
                .backend
                .merge(g, &setup.ctxs[to], Binop::Add, &setup.ctxs[from], Some(&suffix))?
                .ok_or_else(|| {
                    anyhow!("no device merge path for gradient {}", g.header())
                })?;
            grads.push(routine);
        }
        merges.push(((from, to), MergeKernels { grads }));
    }

    // Pre-compile parameter broadcasts `p_to = p_0`; parameters without a
    // device copy path go through the host.
    let mut broadcasts: Vec<Vec<Arc<dyn Routine>>> = vec![Vec::new(); n];
    let mut needed_on_host: Vec<Tensor> = Vec::new();
    for d in 1..n {
        for &p in &setup.param_values {
            let suffix = format!("_copy_d{d}");
            match setup.backend.merge(p, &setup.ctxs[d], Binop::Arg2, &setup.ctxs[0], Some(&suffix))?
            {
                Some(routine) => broadcasts[d].push(routine),
                None => {
                    if !needed_on_host.contains(&p) {
                        needed_on_host.push(p);
                    }
                }
            }
        }
    }

    let sync = |k: usize, post_sync: &mut dyn FnMut(usize) -> Result<()>| -> Result<()> {
        // a. Balanced reduction: await the source, merge on the destination.
        for (from, to) in merge_tree_pairs(k) {
            let from_dev = setup.ctxs[from].device();
            setup.backend.await_device(&from_dev)?;
            let kernels = merges
                .iter()
                .find(|(pair, _)| *pair == (from, to))
                .map(|(_, m)| m)
                .ok_or_else(|| anyhow!("merge pair ({from}, {to}) was not precompiled"))?;
            for routine in &kernels.grads {
                routine.schedule().run()?;
            }
        }
        // b/c. Optimizer step on device 0, then drain it.
        setup.sgd_update.schedule().run()?;
        setup.backend.await_device(&setup.ctxs[0].device())?;
        // d. Host-mediated path for parameters without a device copy kernel.
        for &p in &needed_on_host {
            setup.backend.to_host(&setup.ctxs[0], p)?;
            setup.backend.await_device(&setup.ctxs[0].device())?;
            for d in 1..k {
                setup.backend.from_host(&setup.ctxs[d], p)?;
            }
        }
        // e. Parameter broadcast from device 0.
        for (d, broadcast) in broadcasts.iter().enumerate().take(k).skip(1) {
            for routine in broadcast {
                routine.schedule().run()?;
            }
            setup.backend.await_device(&setup.ctxs[d].device())?;
        }
        // f. Post-sync callback with the participation count.
        post_sync(k)
    };

    let mut since_sync = 0usize;
    round_robin(&setup.bindings, |pos| {
        let d = pos % n;
        setup.grad_updates[d].schedule().run()?;
        since_sync += 1;
        if since_sync == n {
            debug!("sync at position {pos} with {n} devices");
            sync(n, &mut post_sync)?;
            since_sync = 0;
        }
        Ok(())
    })?;
    if since_sync > 0 {
        debug!("final sync with {since_sync} devices");
        sync(since_sync, &mut post_sync)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::{empty_bindings, StaticBinding, Symbol};

    #[test]
    fn round_robin_exhausts_the_product() {
        let a = StaticBinding::new(Symbol::fresh(), Some(3));
        let b = StaticBinding::new(Symbol::fresh(), Some(2));
        let fixed = StaticBinding::new(Symbol::fresh(), None);
        fixed.set(41);
        let bindings = empty_bindings()
            .extend(a.clone())
            .unwrap()
            .extend(b.clone())
            .unwrap()
            .extend(fixed.clone())
            .unwrap();
        let mut seen = Vec::new();
        let total = round_robin(&bindings, |pos| {
            seen.push((pos, a.get(), b.get()));
            Ok(())
        })
        .unwrap();
        assert_eq!(total, 6);
        assert_eq!(seen.len(), 6);
        // Each combination appears exactly once; the last binding is fastest.
        assert_eq!(seen[0], (0, 0, 0));
        assert_eq!(seen[1], (1, 0, 1));
        assert_eq!(seen[2], (2, 1, 0));
        for v in 0..3 {
            assert_eq!(seen.iter().filter(|(_, x, _)| *x == v).count(), 2);
        }
        // Unranged bindings keep their value across the pass.
        assert_eq!(fixed.get(), 41);
    }

    #[test]
    fn merge_tree_halves_pairwise() {
        assert!(merge_tree_pairs(1).is_empty());
        assert_eq!(merge_tree_pairs(2), vec![(1, 0)]);
        assert_eq!(merge_tree_pairs(3), vec![(2, 0), (1, 0)]);
        assert_eq!(merge_tree_pairs(4), vec![(2, 0), (3, 1), (1, 0)]);
        // Every source reduces exactly once and everything lands on 0.
        for k in 1..9 {
            let pairs = merge_tree_pairs(k);
            let mut sources: Vec<usize> = pairs.iter().map(|(from, _)| *from).collect();
            sources.sort_unstable();
            assert_eq!(sources, (1..k).collect::<Vec<_>>());
            for (from, to) in pairs {
                assert!(to < from);
            }
        }
    }

    #[test]
    fn worker_queue_runs_and_shuts_down() {
        let queue = WorkerQueue::spawn("test-worker".into());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..5 {
            let hits = hits.clone();
            queue
                .submit(Arc::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        queue.await_idle().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        queue.shutdown();
    }

    #[test]
    fn worker_queue_poisons_on_failure() {
        let queue = WorkerQueue::spawn("poison-worker".into());
        queue.submit(Arc::new(|| bail!("kernel launch failed"))).unwrap();
        let err = queue.await_idle().unwrap_err();
        assert!(err.to_string().contains("poisoned"), "{err}");
        queue.shutdown();
    }
}
