//! A single-threaded queue of delayed and periodic callbacks.
//!
//! Timers are owned by a worker thread; [`TimerQueue::add`] and
//! [`TimerQueue::remove`] talk to it over a channel, so handlers never race
//! with changes to the pending set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::Result;

/// Highest timer id; ids come from a 6-bit pool.
pub const MAX_TIMERS: i32 = 63;

/// Called when a timer expires. For periodic timers, returning `false`
/// cancels the timer.
pub type TimerHandler = Box<dyn FnMut() -> bool + Send>;

enum Command {
    Add {
        id: i32,
        timeout: Duration,
        one_shot: bool,
        handler: TimerHandler,
    },
    Remove {
        id: i32,
        reply: Sender<bool>,
    },
    Stop,
}

#[derive(Default)]
struct IdPool(Mutex<u64>);

impl IdPool {
    fn alloc(&self) -> Option<i32> {
        let mut used = self.0.lock().unwrap();
        let id = (1..=MAX_TIMERS).find(|id| *used & (1 << id) == 0)?;
        *used |= 1 << id;
        Some(id)
    }

    fn release(&self, id: i32) {
        *self.0.lock().unwrap() &= !(1 << id);
    }
}

struct Timer {
    id: i32,
    timeout: Duration,
    one_shot: bool,
    handler: TimerHandler,
}

pub struct TimerQueue {
    tx: Sender<Command>,
    ids: Arc<IdPool>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TimerQueue {
    pub fn new() -> Result<Self> {
        let (tx, rx) = unbounded();
        let ids = Arc::new(IdPool::default());

        let worker = thread::Builder::new().name("timer-queue".into()).spawn({
            let ids = ids.clone();
            move || run(rx, ids)
        })?;

        Ok(Self {
            tx,
            ids,
            stopped: AtomicBool::new(false),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedules `handler` to run after `timeout`, and every `timeout` after
    /// that unless `one_shot` is set.
    ///
    /// Returns the timer id, or `-1` if the queue is stopped or all
    /// [`MAX_TIMERS`] ids are in use.
    pub fn add<F>(&self, timeout: Duration, one_shot: bool, handler: F) -> i32
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            log::error!("timer queue is stopped");
            return -1;
        }
        let Some(id) = self.ids.alloc() else {
            log::error!("too many timers, limit is {MAX_TIMERS}");
            return -1;
        };

        let cmd = Command::Add {
            id,
            timeout,
            one_shot,
            handler: Box::new(handler),
        };
        if self.tx.send(cmd).is_err() {
            self.ids.release(id);
            return -1;
        }
        id
    }

    /// Cancels a timer. Once this returns `true` the handler will not run
    /// again.
    ///
    /// Not allowed from inside a handler: it returns `false` there, and a
    /// periodic handler should return `false` instead.
    pub fn remove(&self, id: i32) -> bool {
        if thread::current().id() == self.worker_id {
            log::error!("cannot remove timer {id} from within a timer handler");
            return false;
        }

        let (reply, rx) = bounded(1);
        if self.tx.send(Command::Remove { id, reply }).is_err() {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Stops the worker and drops every pending timer. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Command::Stop);

        if thread::current().id() == self.worker_id {
            // the worker exits once the running handler returns
            return;
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                log::error!("timer queue worker panicked");
            }
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(rx: Receiver<Command>, ids: Arc<IdPool>) {
    // ordered by deadline; the sequence number keeps equal deadlines in
    // insertion order
    let mut timers: BTreeMap<(Instant, u64), Timer> = BTreeMap::new();
    let mut seq = 0u64;

    loop {
        let next = timers.keys().next().map(|(deadline, _)| *deadline);
        let cmd = match next {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    None
                } else {
                    match rx.recv_timeout(deadline - now) {
                        Ok(cmd) => Some(cmd),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            None => {
                let now = Instant::now();
                while let Some(entry) = timers.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let mut timer = entry.remove();
                    let again = (timer.handler)();
                    if timer.one_shot || !again {
                        ids.release(timer.id);
                    } else {
                        seq += 1;
                        timers.insert((Instant::now() + timer.timeout, seq), timer);
                    }
                }
            }
            Some(Command::Add {
                id,
                timeout,
                one_shot,
                handler,
            }) => {
                seq += 1;
                let timer = Timer {
                    id,
                    timeout,
                    one_shot,
                    handler,
                };
                timers.insert((Instant::now() + timeout, seq), timer);
            }
            Some(Command::Remove { id, reply }) => {
                let key = timers
                    .iter()
                    .find(|(_, timer)| timer.id == id)
                    .map(|(key, _)| *key);
                let found = key.and_then(|key| timers.remove(&key)).is_some();
                if found {
                    ids.release(id);
                } else {
                    log::warn!("no timer with id {id}");
                }
                let _ = reply.send(found);
            }
            Some(Command::Stop) => break,
        }
    }

    for timer in timers.into_values() {
        ids.release(timer.id);
    }
    log::debug!("timer queue stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_fires_in_deadline_order() -> Result<()> {
        let queue = TimerQueue::new()?;
        let (tx, rx) = unbounded();
        for ms in [300u64, 100, 0, 200] {
            let tx = tx.clone();
            let id = queue.add(Duration::from_millis(ms), true, move || {
                let _ = tx.send(ms);
                false
            });
            assert!(id > 0);
        }

        let fired: Vec<u64> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(fired, vec![0, 100, 200, 300]);
        // one-shot timers do not fire again
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        Ok(())
    }

    #[test]
    fn test_periodic_until_handler_declines() -> Result<()> {
        let queue = TimerQueue::new()?;
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();

        let id = queue.add(Duration::from_millis(20), false, {
            let count = count.clone();
            move || {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    let _ = tx.send(());
                }
                n < 3
            }
        });
        assert!(id > 0);

        rx.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // the timer cancelled itself
        assert!(!queue.remove(id));
        Ok(())
    }

    #[test]
    fn test_removed_timer_never_fires() -> Result<()> {
        let queue = TimerQueue::new()?;
        let fired = Arc::new(AtomicBool::new(false));
        let id = queue.add(Duration::from_millis(100), true, {
            let fired = fired.clone();
            move || {
                fired.store(true, Ordering::SeqCst);
                false
            }
        });
        assert!(queue.remove(id));
        thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!queue.remove(id));
        Ok(())
    }

    #[test]
    fn test_id_limit() -> Result<()> {
        let queue = TimerQueue::new()?;
        let ids: Vec<i32> = (0..MAX_TIMERS)
            .map(|_| queue.add(Duration::from_secs(60), true, || false))
            .collect();
        assert!(ids.iter().all(|id| (1..=MAX_TIMERS).contains(id)));
        assert_eq!(queue.add(Duration::from_secs(60), true, || false), -1);

        assert!(queue.remove(ids[10]));
        assert_eq!(queue.add(Duration::from_secs(60), true, || false), ids[10]);

        for id in ids {
            assert!(queue.remove(id));
        }
        assert!(queue.add(Duration::from_secs(60), true, || false) > 0);
        Ok(())
    }

    #[test]
    fn test_remove_from_handler_is_refused() -> Result<()> {
        let queue = Arc::new(TimerQueue::new()?);
        let (tx, rx) = unbounded();

        let id = Arc::new(Mutex::new(0));
        let handler = {
            let queue = queue.clone();
            let id = id.clone();
            move || {
                let _ = tx.send(queue.remove(*id.lock().unwrap()));
                false
            }
        };
        *id.lock().unwrap() = queue.add(Duration::from_millis(10), false, handler);

        assert!(!rx.recv_timeout(WAIT).unwrap());
        queue.stop();
        Ok(())
    }

    #[test]
    fn test_add_after_stop() -> Result<()> {
        let queue = TimerQueue::new()?;
        let pending = queue.add(Duration::from_secs(60), true, || false);
        assert!(pending > 0);
        queue.stop();
        queue.stop();
        assert_eq!(queue.add(Duration::from_millis(1), true, || false), -1);
        assert!(!queue.remove(pending));
        Ok(())
    }
}
