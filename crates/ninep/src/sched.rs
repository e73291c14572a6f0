//! Cooperative scheduling for single-threaded protocol drivers.
//!
//! The primitives here pin execution to one thread: exactly one task runs
//! at a time, a task gives up the processor only at an await point, and
//! wakeups are delivered in FIFO order. [`Runtime::block_on`] is the
//! scheduler loop; [`yield_now`] requeues the current task at the tail of
//! the runnable queue; [`Wait`] and [`Semaphore`] are the two blocking
//! rendezvous, built on the same wakeup queue as readiness-driven I/O.

use std::future::Future;
use std::io;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};

/// A single-threaded task scheduler driving an I/O reactor.
pub struct Runtime {
    rt: tokio::runtime::Runtime,
    local: LocalSet,
}

impl Runtime {
    pub fn new() -> io::Result<Runtime> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Runtime {
            rt,
            local: LocalSet::new(),
        })
    }

    /// Run a future to completion, scheduling every task spawned with
    /// [`spawn`] on the calling thread. Blocks until `fut` resolves; tasks
    /// still pending at that point are dropped.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.local.block_on(&self.rt, fut)
    }
}

/// Spawn a task onto the runnable queue of the current [`Runtime`].
///
/// The task starts runnable and first executes when the spawner next
/// yields. Must be called from within [`Runtime::block_on`].
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(fut)
}

/// Requeue the current task at the tail of the runnable queue and let the
/// next runnable task execute.
pub async fn yield_now() {
    tokio::task::yield_now().await
}

/// A one-shot rendezvous between a single waiter and a notifier.
///
/// A notification that arrives while nobody is waiting is held until the
/// next [`wait`](Wait::wait), so the pair is race-free regardless of
/// which side reaches the rendezvous first.
#[derive(Debug, Default)]
pub struct Wait {
    inner: Notify,
}

impl Wait {
    pub fn new() -> Wait {
        Wait::default()
    }

    /// Suspend the current task until [`notify`](Wait::notify) is called.
    pub async fn wait(&self) {
        self.inner.notified().await
    }

    /// Make the waiter runnable.
    pub fn notify(&self) {
        self.inner.notify_one()
    }
}

/// A counting semaphore with FIFO waiters.
#[derive(Debug)]
pub struct Semaphore {
    inner: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(value: usize) -> Semaphore {
        Semaphore {
            inner: tokio::sync::Semaphore::new(value),
        }
    }

    /// Take one unit, suspending until one is available. Suspended tasks
    /// are woken in the order they arrived.
    pub async fn wait(&self) {
        // The semaphore is never closed, so acquisition cannot fail.
        self.inner
            .acquire()
            .await
            .expect("semaphore closed")
            .forget();
    }

    /// Release one unit, waking the longest-suspended waiter if there is
    /// one.
    pub fn post(&self) {
        self.inner.add_permits(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn yielding_tasks_run_round_robin() {
        const TASKS: usize = 3;
        const ROUNDS: usize = 4;

        let rt = Runtime::new().unwrap();
        let log = rt.block_on(async {
            let log = Rc::new(RefCell::new(Vec::new()));

            let handles: Vec<_> = (0..TASKS)
                .map(|id| {
                    let log = log.clone();
                    spawn(async move {
                        for _ in 0..ROUNDS {
                            log.borrow_mut().push(id);
                            yield_now().await;
                        }
                    })
                })
                .collect();

            for h in handles {
                h.await.unwrap();
            }

            Rc::try_unwrap(log).unwrap().into_inner()
        });

        assert_eq!(log.len(), TASKS * ROUNDS);
        for (i, id) in log.iter().enumerate() {
            assert_eq!(*id, i % TASKS, "round-robin broken at step {}", i);
        }
    }

    #[test]
    fn notify_before_wait_is_not_lost() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let wait = Wait::new();
            wait.notify();
            wait.wait().await;
        });
    }

    #[test]
    fn notify_wakes_a_suspended_waiter() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let wait = Arc::new(Wait::new());
            let done = Rc::new(RefCell::new(false));

            let handle = {
                let wait = wait.clone();
                let done = done.clone();
                spawn(async move {
                    wait.wait().await;
                    *done.borrow_mut() = true;
                })
            };

            // Let the waiter suspend before notifying.
            yield_now().await;
            assert!(!*done.borrow());

            wait.notify();
            handle.await.unwrap();
            assert!(*done.borrow());
        });
    }

    #[test]
    fn semaphore_counts_and_wakes_fifo() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let sem = Arc::new(Semaphore::new(0));
            let order = Rc::new(RefCell::new(Vec::new()));

            let handles: Vec<_> = (0..3)
                .map(|id| {
                    let sem = sem.clone();
                    let order = order.clone();
                    spawn(async move {
                        sem.wait().await;
                        order.borrow_mut().push(id);
                    })
                })
                .collect();

            // Queue all three waiters, then release units one at a time.
            yield_now().await;
            for _ in 0..3 {
                sem.post();
                yield_now().await;
            }

            for h in handles {
                h.await.unwrap();
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn semaphore_initial_value_admits_without_post() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let sem = Semaphore::new(2);
            sem.wait().await;
            sem.wait().await;
        });
    }
}
