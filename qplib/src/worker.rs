//! Deferred task pool
//!
//! Completion notifications for work posted on an errored QP are delivered
//! from here so the posting thread never re-enters the notification path.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

/// Cloneable submission side of the pool
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<Message>,
    pending: Arc<AtomicUsize>,
}

impl WorkerHandle {
    /// Queue `task`; returns false if the pool has shut down
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Message::Run(Box::new(task))).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!("Worker pool stopped, deferred task dropped");
            return false;
        }
        true
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct WorkerPool {
    handle: WorkerHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one)
    pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Message>();
        let pending = Arc::new(AtomicUsize::new(0));

        let handles = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || worker_loop(rx, pending))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!("Worker pool '{}' started with {} threads", name, handles.len());
        Ok(Self {
            handle: WorkerHandle { tx, pending },
            threads: Mutex::new(handles),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Block until every queued task has run
    pub fn drain(&self) {
        while self.handle.pending() > 0 {
            thread::yield_now();
        }
    }

    /// Stop all workers after the tasks already queued. Idempotent.
    pub fn shutdown(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        for _ in 0..threads.len() {
            let _ = self.handle.tx.send(Message::Stop);
        }
        for handle in threads {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Message>, pending: Arc<AtomicUsize>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(task) => {
                task();
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            Message::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_tasks_run() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            assert!(pool.handle().submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_shutdown_idempotent_and_rejects() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let handle = pool.handle();
        pool.shutdown();
        pool.shutdown();
        assert!(!handle.submit(|| {}));
        assert_eq!(handle.pending(), 0);
    }
}
