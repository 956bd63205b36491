use std::{
    io,
    sync::{Arc, Mutex, Weak, mpsc},
    thread,
    time::Duration,
};

use log::{debug, trace, warn};

use crate::utilities::{isolate, lock};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads running queued jobs.
///
/// Cloning is cheap; the workers shut down once the last clone is dropped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl Scheduler {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver))?);
        }
        debug!("scheduler started with {size} worker(s)");

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                workers,
                sender: Some(sender),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.workers.len()
    }

    /// Queues `f` for execution on one of the workers.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(Box::new(f));
    }

    /// Queues `f` once `delay` has elapsed.
    ///
    /// The job is dropped if every handle to the scheduler is gone by then.
    pub fn execute_after<F>(&self, delay: Duration, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("omlstore-timer".into())
            .spawn(move || {
                thread::sleep(delay);
                match scheduler.upgrade() {
                    Some(inner) => inner.submit(Box::new(f)),
                    None => debug!("scheduler gone, dropping delayed job"),
                }
            })?;
        trace!("scheduled job in {delay:?}");
        Ok(())
    }
}

impl SchedulerInner {
    fn submit(&self, job: Job) {
        let sent = match self.sender.as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            warn!("scheduler is shutting down, job dropped");
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        drop(self.sender.take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last handle can be dropped by a job on a worker; that worker
            // exits on its own once the channel is closed.
            if worker.thread.thread().id() == current {
                continue;
            }
            debug!("shutting down worker {}", worker.id);
            if worker.thread.join().is_err() {
                warn!("worker {} terminated abnormally", worker.id);
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> io::Result<Self> {
        let name = format!("omlstore-worker-{id}");
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                let msg = lock(&receiver).recv();
                match msg {
                    Ok(job) => {
                        trace!("worker {id} running a job");
                        isolate(&name, job);
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { id, thread })
    }
}
