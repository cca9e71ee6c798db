use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

pub type MaintenanceFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct SchedulerCore {
    /// Set while a pass is queued but has not started yet.
    pending: AtomicBool,
    outstanding: Mutex<usize>,
    idle: Condvar,
    completed: AtomicU64,
}

impl SchedulerCore {
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// Runs maintenance passes on a dedicated background thread.
///
/// At most one pass runs at a time (there is a single worker) and at most one
/// more can be queued behind it. The pending flag is cleared when a pass
/// starts, so growth that happens during a pass is still noticed and earns
/// exactly one follow-up pass.
#[derive(Debug)]
pub struct MaintenanceScheduler {
    core: Arc<SchedulerCore>,
    sender: Option<Sender<MaintenanceFn>>,
}

impl MaintenanceScheduler {
    pub fn new() -> Self {
        let core = Arc::new(SchedulerCore::default());
        let (sender, receiver) = crossbeam_channel::unbounded();

        let worker_core = Arc::clone(&core);
        let spawned = thread::Builder::new()
            .name("codecache-maintenance".to_string())
            .spawn(move || worker_loop(&worker_core, &receiver));

        let sender = match spawned {
            Ok(_) => Some(sender),
            Err(err) => {
                warn!(error = %err, "failed to spawn maintenance worker; maintenance disabled");
                None
            }
        };

        Self { core, sender }
    }

    /// Queues `pass` if `current_approx` exceeds `max_bytes * high_water_fraction`
    /// and no pass is already pending. Never blocks on the pass itself.
    pub fn maybe_schedule<F>(
        &self,
        current_approx: u64,
        max_bytes: u64,
        high_water_fraction: f64,
        pass: F,
    ) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if current_approx as f64 <= max_bytes as f64 * high_water_fraction {
            return false;
        }
        let scheduled = self.schedule(pass);
        if scheduled {
            debug!(approximate = current_approx, max = max_bytes, "scheduled cache maintenance");
        }
        scheduled
    }

    /// Queues `pass` unconditionally, subject to the single-pending rule.
    pub fn schedule<F>(&self, pass: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };

        // The flag flips under the outstanding lock so `wait_idle` never sees a
        // pending pass with nothing outstanding.
        {
            let mut outstanding = self.core.outstanding.lock();
            if self
                .core
                .pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            *outstanding += 1;
        }

        if sender.send(Box::new(pass)).is_err() {
            self.core.pending.store(false, Ordering::Release);
            self.core.finish_one();
            return false;
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.core.pending.load(Ordering::Acquire)
    }

    pub fn completed_runs(&self) -> u64 {
        self.core.completed.load(Ordering::Acquire)
    }

    /// Blocks until no pass is queued or running, or `timeout` elapses.
    /// Returns whether the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.core.outstanding.lock();
        while *outstanding > 0 {
            if self
                .core
                .idle
                .wait_until(&mut outstanding, deadline)
                .timed_out()
            {
                return *outstanding == 0;
            }
        }
        true
    }
}

impl Default for MaintenanceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(core: &SchedulerCore, receiver: &Receiver<MaintenanceFn>) {
    for pass in receiver {
        core.pending.store(false, Ordering::Release);
        if panic::catch_unwind(AssertUnwindSafe(pass)).is_err() {
            warn!("cache maintenance pass panicked");
        }
        core.completed.fetch_add(1, Ordering::AcqRel);
        core.finish_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(10);

    fn counting_pass(runs: Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn below_high_water_does_not_schedule() {
        let scheduler = MaintenanceScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.maybe_schedule(800, 1_000, 0.8, counting_pass(Arc::clone(&runs))));
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn crossing_high_water_runs_one_pass() {
        let scheduler = MaintenanceScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.maybe_schedule(801, 1_000, 0.8, counting_pass(Arc::clone(&runs))));
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.completed_runs(), 1);
        assert!(!scheduler.is_pending());
    }

    #[test]
    fn concurrent_triggers_during_a_pass_queue_exactly_one_more() {
        let scheduler = MaintenanceScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let first = {
            let runs = Arc::clone(&runs);
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }
        };
        assert!(scheduler.schedule(first));
        started_rx.recv().unwrap();

        let winners: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let pass = counting_pass(Arc::clone(&runs));
                    let scheduler = &scheduler;
                    scope.spawn(move || usize::from(scheduler.maybe_schedule(2_000, 1_000, 0.8, pass)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);

        release_tx.send(()).unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_pass_blocks_further_scheduling() {
        let scheduler = MaintenanceScheduler::new();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule(move || {
            release_rx.recv().unwrap();
        }));
        // Wait until the blocking pass has started and cleared the flag.
        while scheduler.is_pending() {
            thread::yield_now();
        }
        assert!(scheduler.schedule(counting_pass(Arc::clone(&runs))));
        assert!(!scheduler.schedule(counting_pass(Arc::clone(&runs))));

        release_tx.send(()).unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_pass_does_not_stop_the_worker() {
        let scheduler = MaintenanceScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule(|| panic!("boom")));
        assert!(scheduler.wait_idle(WAIT));
        assert!(scheduler.schedule(counting_pass(Arc::clone(&runs))));
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_pass_is_never_reported_idle() {
        for _ in 0..200 {
            let scheduler = MaintenanceScheduler::new();
            let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

            thread::scope(|scope| {
                let scheduler = &scheduler;
                scope.spawn(move || {
                    assert!(scheduler.schedule(move || {
                        release_rx.recv().unwrap();
                    }));
                });
                while !scheduler.is_pending() && scheduler.completed_runs() == 0 {
                    if scheduler.wait_idle(Duration::ZERO) {
                        thread::yield_now();
                    } else {
                        break;
                    }
                }
                // Queued or blocked in the pass: either way it is outstanding.
                if scheduler.is_pending() {
                    assert!(!scheduler.wait_idle(Duration::ZERO));
                }
                release_tx.send(()).unwrap();
            });
            assert!(scheduler.wait_idle(WAIT));
        }
    }
}
