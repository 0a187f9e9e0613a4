/// Deferred stop scheduler
///
/// Backs [`Audio::play_with_duration`](crate::Audio::play_with_duration):
/// a background thread that stops a voice after a delay. Entries hold only
/// a weak reference to the voice and re-check the disposed flag right
/// before acting, so disposal at any point cancels the stop. A scheduled
/// stop is deliberately unordered against a manual stop on the same voice;
/// whichever runs last wins.
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::instance::{AudioInstance, WeakAudioInstance};

enum SchedulerCommand {
    Schedule(Entry),
    Shutdown,
}

struct Entry {
    fire_at: Instant,
    sequence: u64,
    instance: WeakAudioInstance,
    fade_out: Option<Duration>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Handle to the scheduler thread. Clones share the same thread.
///
/// Dropping every handle disconnects the command channel and the thread
/// exits on its own; [`shutdown`](Self::shutdown) additionally joins it.
#[derive(Clone)]
pub struct StopScheduler {
    tx: Sender<SchedulerCommand>,
    sequence: Arc<AtomicU64>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StopScheduler {
    /// Spawn the scheduler thread.
    pub fn start() -> Self {
        let (tx, rx) = unbounded();

        let thread = thread::spawn(move || {
            tracing::debug!("Stop scheduler thread started");
            let mut pending: BinaryHeap<Entry> = BinaryHeap::new();

            loop {
                let command = match pending.peek() {
                    Some(next) => {
                        let timeout = next.fire_at.saturating_duration_since(Instant::now());
                        match rx.recv_timeout(timeout) {
                            Ok(command) => Some(command),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match rx.recv() {
                        Ok(command) => Some(command),
                        Err(_) => break,
                    },
                };

                match command {
                    Some(SchedulerCommand::Schedule(entry)) => pending.push(entry),
                    Some(SchedulerCommand::Shutdown) => break,
                    None => {}
                }

                let now = Instant::now();
                while pending.peek().map_or(false, |e| e.fire_at <= now) {
                    let entry = pending.pop().expect("peeked entry");
                    fire(entry);
                }
            }

            tracing::debug!("Stop scheduler thread stopped");
        });

        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
            thread: Arc::new(Mutex::new(Some(thread))),
        }
    }

    /// Stop `instance` after `delay`, optionally with a fade-out. The entry
    /// dies with the instance: disposal cancels it.
    pub fn schedule_stop(
        &self,
        instance: &AudioInstance,
        delay: Duration,
        fade_out: Option<Duration>,
    ) {
        let entry = Entry {
            fire_at: Instant::now() + delay,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            instance: instance.downgrade(),
            fade_out,
        };
        if self.tx.send(SchedulerCommand::Schedule(entry)).is_err() {
            tracing::warn!("Stop scheduler is not running; deferred stop dropped");
        }
    }

    /// Stop the thread, dropping pending entries. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SchedulerCommand::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("Stop scheduler thread panicked");
            }
        }
    }
}

fn fire(entry: Entry) {
    let instance = match entry.instance.upgrade() {
        Some(instance) => instance,
        None => return, // voice already pruned
    };
    if instance.is_disposed() {
        return;
    }
    instance.stop(entry.fade_out);
}
