use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A source of CPU ids used to pick a shard for a write.
///
/// The id only needs to be reasonably stable for a calling thread; shards are
/// selected with `id % shard_count`.
pub trait CpuSource: Send + Sync + 'static {
    fn current_cpu(&self) -> usize;
}

/// CPU id reported by the scheduler.
///
/// Uses `sched_getcpu` on Linux and falls back to [`ThreadSlot`] elsewhere or
/// when the call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedCpu;

impl CpuSource for SchedCpu {
    #[cfg(target_os = "linux")]
    fn current_cpu(&self) -> usize {
        // SAFETY: sched_getcpu takes no arguments and only reads scheduler state.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            ThreadSlot.current_cpu()
        } else {
            cpu as usize
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn current_cpu(&self) -> usize {
        ThreadSlot.current_cpu()
    }
}

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Hands every thread its own slot number on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSlot;

impl CpuSource for ThreadSlot {
    fn current_cpu(&self) -> usize {
        SLOT.with(|slot| match slot.get() {
            Some(id) => id,
            None => {
                let id = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
                slot.set(Some(id));
                id
            }
        })
    }
}

/// Always reports the same id. Routes every write to one shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCpu(pub usize);

impl CpuSource for FixedCpu {
    fn current_cpu(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_thread_slot_is_stable_per_thread() {
        let first = ThreadSlot.current_cpu();
        assert_eq!(ThreadSlot.current_cpu(), first);
        let other = thread::spawn(|| ThreadSlot.current_cpu())
            .join()
            .expect("join slot thread");
        assert_ne!(other, first);
    }

    #[test]
    fn test_fixed_cpu() {
        assert_eq!(FixedCpu(3).current_cpu(), 3);
    }
}
