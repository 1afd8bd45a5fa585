//! Dedicated-thread executors.
//!
//! A [`Worker`] owns a value on its own thread. Other threads post closures with
//! [`Worker::run`] and wait on the returned [`Outcome`]. The owned value is only ever
//! reachable as `&mut T` from inside the worker thread, which gives every device a
//! single thread of affinity.

use log::{debug, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{Result, ScannerError};

type Job<T> = Box<dyn FnOnce(&mut T) + Send>;
type Poll<T> = Box<dyn FnMut(&mut T) -> Option<Duration> + Send>;

enum Message<T> {
    Run(Job<T>),
    RunAt(Instant, Job<T>),
}

/// Single-resolution handle to the result of a job posted to a worker
#[must_use]
pub enum Outcome<R> {
    Pending { worker: String, receiver: Receiver<R> },
    Ready(R),
    Stopped(String),
}

impl<R> Outcome<R> {
    pub fn ready(value: R) -> Self {
        Outcome::Ready(value)
    }

    /// Block until the job has run
    pub fn result(self) -> Result<R> {
        match self {
            Outcome::Ready(value) => Ok(value),
            Outcome::Pending { worker, receiver } => receiver
                .recv()
                .map_err(|_| ScannerError::WorkerStopped(worker)),
            Outcome::Stopped(worker) => Err(ScannerError::WorkerStopped(worker)),
        }
    }
}

impl<R> Outcome<Result<R>> {
    /// Block until the job has run and flatten its own result
    pub fn settle(self) -> Result<R> {
        self.result()?
    }
}

/// Thread owning a value of type `T`
pub struct Worker<T: Send + 'static> {
    name: String,
    sender: Option<Sender<Message<T>>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl<T: Send + 'static> Worker<T> {
    /// Move `object` onto a new thread named `name`
    pub fn spawn(name: &str, object: T) -> Result<Self> {
        Self::start(name, object, None)
    }

    /// Like [`Worker::spawn`], additionally calling `poll` after every message and whenever
    /// the interval it returns elapses. Returning `None` suspends polling until the next
    /// message arrives.
    pub fn spawn_polling<P>(name: &str, object: T, poll: P) -> Result<Self>
    where
        P: FnMut(&mut T) -> Option<Duration> + Send + 'static,
    {
        Self::start(name, object, Some(Box::new(poll)))
    }

    fn start(name: &str, object: T, poll: Option<Poll<T>>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop(object, receiver, poll))?;
        let thread_id = handle.thread().id();

        debug!("Worker '{}' started", name);
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            handle: Some(handle),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// True when called from the worker's own thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `f` on the worker thread
    pub fn run<R, F>(&self, f: F) -> Outcome<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job<T> = Box::new(move |object| {
            let _ = tx.send(f(object));
        });
        self.post(Message::Run(job), rx)
    }

    /// Run `f` on the worker thread once `delay` has elapsed
    pub fn run_delayed<R, F>(&self, delay: Duration, f: F) -> Outcome<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job<T> = Box::new(move |object| {
            let _ = tx.send(f(object));
        });
        self.post(Message::RunAt(Instant::now() + delay, job), rx)
    }

    fn post<R>(&self, message: Message<T>, receiver: Receiver<R>) -> Outcome<R> {
        match &self.sender {
            Some(sender) if sender.send(message).is_ok() => Outcome::Pending {
                worker: self.name.clone(),
                receiver,
            },
            _ => Outcome::Stopped(self.name.clone()),
        }
    }

    /// Stop accepting jobs and wait for the thread to finish the queued ones
    pub fn shutdown(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if self.is_current() {
                warn!("Worker '{}' shut down from its own thread", self.name);
                return;
            }
            if handle.join().is_err() {
                warn!("Worker '{}' panicked", self.name);
            }
            debug!("Worker '{}' stopped", self.name);
        }
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn event_loop<T>(mut object: T, receiver: Receiver<Message<T>>, mut poll: Option<Poll<T>>) {
    let mut delayed: Vec<(Instant, Job<T>)> = Vec::new();
    let mut poll_after: Option<Duration> = None;

    loop {
        let now = Instant::now();
        let next_delayed = delayed.iter().map(|(at, _)| *at).min();
        let wait = match (next_delayed, poll_after) {
            (Some(at), Some(p)) => Some(at.saturating_duration_since(now).min(p)),
            (Some(at), None) => Some(at.saturating_duration_since(now)),
            (None, Some(p)) => Some(p),
            (None, None) => None,
        };

        let message = match wait {
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            },
        };

        match message {
            Some(Message::Run(job)) => job(&mut object),
            Some(Message::RunAt(at, job)) => delayed.push((at, job)),
            None => {}
        }

        let now = Instant::now();
        let mut index = 0;
        while index < delayed.len() {
            if delayed[index].0 <= now {
                let (_, job) = delayed.swap_remove(index);
                job(&mut object);
            } else {
                index += 1;
            }
        }

        if let Some(poll) = poll.as_mut() {
            poll_after = poll(&mut object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_executes_on_worker_thread() {
        let worker = Worker::spawn("test-worker", 0u32).unwrap();
        let worker_thread = worker.thread_id();

        let (value, thread) = worker
            .run(|counter| {
                *counter += 5;
                (*counter, thread::current().id())
            })
            .result()
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(thread, worker_thread);
        assert!(!worker.is_current());
    }

    #[test]
    fn jobs_run_in_order() {
        let worker = Worker::spawn("ordered", Vec::<u32>::new()).unwrap();
        for i in 0..10 {
            let _ = worker.run(move |v| v.push(i));
        }
        let values = worker.run(|v| v.clone()).result().unwrap();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_job_waits() {
        let worker = Worker::spawn("delayed", ()).unwrap();
        let started = Instant::now();
        let elapsed = worker
            .run_delayed(Duration::from_millis(60), move |_| started.elapsed())
            .result()
            .unwrap();
        assert!(elapsed >= Duration::from_millis(60));
    }

    #[test]
    fn delayed_job_does_not_block_immediate_jobs() {
        let worker = Worker::spawn("mixed", Vec::<&'static str>::new()).unwrap();
        let late = worker.run_delayed(Duration::from_millis(100), |v| v.push("late"));
        worker.run(|v| v.push("early")).result().unwrap();
        late.result().unwrap();
        let order = worker.run(|v| v.clone()).result().unwrap();
        assert_eq!(order, vec!["early", "late"]);
    }

    #[test]
    fn polling_runs_periodically() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let worker = Worker::spawn_polling("poller", (), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Duration::from_millis(5))
        })
        .unwrap();
        worker.run(|_| ()).result().unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(ticks.load(Ordering::SeqCst) > 3);
    }

    #[test]
    fn stopped_worker_reports_error() {
        let mut worker = Worker::spawn("stopped", ()).unwrap();
        worker.shutdown();
        let err = worker.run(|_| ()).result().unwrap_err();
        assert!(matches!(err, ScannerError::WorkerStopped(name) if name == "stopped"));
    }

    #[test]
    fn settle_flattens_nested_result() {
        let worker = Worker::spawn("settle", ()).unwrap();
        let ok: Result<u8> = worker.run(|_| Ok(3)).settle();
        assert_eq!(ok.unwrap(), 3);
        let err: Result<u8> = worker
            .run(|_| Err(ScannerError::Orchestration("boom".into())))
            .settle();
        assert_eq!(err.unwrap_err().to_string(), "boom");
    }
}
