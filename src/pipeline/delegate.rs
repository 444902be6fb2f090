// SPDX-License-Identifier: GPL-3.0-only

//! Delegate notifications and the queues they are delivered on
//!
//! The capture thread never calls the delegate directly. Every notification
//! is wrapped in a job and handed to the consumer's [`CallbackQueue`], and
//! the delegate is only upgraded from its weak reference once the job runs,
//! so a consumer can go away at any time.

use super::pool::PreviewBuffer;
use crate::backends::camera::Device;
use crate::errors::PipelineError;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

/// A unit of work for a callback queue
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Receives pipeline notifications
///
/// Calls arrive on the queue passed to
/// [`CapturePipeline::set_delegate`](super::CapturePipeline::set_delegate),
/// in the order the pipeline produced them.
pub trait CapturePipelineDelegate: Send + Sync {
    /// Exactly once per successful start
    fn did_start_running(&self, device: &Device);

    /// Exactly once per started session; `None` for a requested stop
    fn did_stop_running(&self, error: Option<PipelineError>);

    /// A rendered frame; drop it promptly to return it to the pool
    fn preview_buffer_ready(&self, buffer: PreviewBuffer);

    /// A frame was dropped because every preview buffer was in use
    fn did_run_out_of_preview_buffers(&self);
}

/// Serial executor for delegate callbacks
pub trait CallbackQueue: Send + Sync {
    /// Run `job` after every previously dispatched job
    fn dispatch(&self, job: Job);
}

/// Jobs are forwarded to whoever drains the receiver, typically a task on
/// the consumer's tokio runtime.
impl CallbackQueue for UnboundedSender<Job> {
    fn dispatch(&self, job: Job) {
        if self.send(job).is_err() {
            debug!("Callback receiver closed, dropping notification");
        }
    }
}

/// Callback queue backed by a dedicated thread
pub struct SerialQueue {
    name: String,
    sender: Option<UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl SerialQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded_channel::<Job>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(receiver))?;
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    fn run(mut receiver: UnboundedReceiver<Job>) {
        while let Some(job) = receiver.blocking_recv() {
            job();
        }
    }

    /// Block until every job dispatched so far has run.
    ///
    /// Must not be called from a job running on this queue.
    pub fn flush(&self) {
        let (done_tx, done_rx) = sync_channel::<()>(1);
        self.dispatch(Box::new(move || {
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }
}

impl CallbackQueue for SerialQueue {
    fn dispatch(&self, job: Job) {
        if let Some(sender) = &self.sender {
            sender.dispatch(job);
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain what is queued and exit
        self.sender.take();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(name = %self.name, "Callback queue thread panicked");
            }
        }
    }
}

type Registration = (Weak<dyn CapturePipelineDelegate>, Arc<dyn CallbackQueue>);

/// Current delegate and queue, shared with the capture thread
#[derive(Clone, Default)]
pub(crate) struct DelegateSlot {
    inner: Arc<RwLock<Option<Registration>>>,
}

impl DelegateSlot {
    pub(crate) fn set(
        &self,
        delegate: Weak<dyn CapturePipelineDelegate>,
        queue: Arc<dyn CallbackQueue>,
    ) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some((delegate, queue));
    }

    pub(crate) fn clear(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Queue `notify` for the delegate; dropped if none is registered or
    /// the delegate is gone by the time the job runs.
    pub(crate) fn notify<F>(&self, notify: F)
    where
        F: FnOnce(&dyn CapturePipelineDelegate) + Send + 'static,
    {
        let registration = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some((delegate, queue)) = registration else {
            return;
        };
        queue.dispatch(Box::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                notify(delegate.as_ref());
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CapturePipelineDelegate for Recorder {
        fn did_start_running(&self, device: &Device) {
            self.events.lock().unwrap().push(format!("start {}", device.id));
        }

        fn did_stop_running(&self, error: Option<PipelineError>) {
            self.events.lock().unwrap().push(format!("stop {:?}", error));
        }

        fn preview_buffer_ready(&self, _buffer: PreviewBuffer) {
            self.events.lock().unwrap().push("buffer".to_string());
        }

        fn did_run_out_of_preview_buffers(&self) {
            self.events.lock().unwrap().push("exhausted".to_string());
        }
    }

    #[test]
    fn test_serial_queue_preserves_order() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            queue.dispatch(Box::new(move || seen.lock().unwrap().push(i)));
        }
        queue.flush();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_delegate_is_not_called() {
        let queue = Arc::new(SerialQueue::new("test-weak").unwrap());
        let slot = DelegateSlot::default();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn CapturePipelineDelegate> = Arc::<Recorder>::downgrade(&recorder);
        slot.set(weak, queue.clone());

        slot.notify(|d| d.did_run_out_of_preview_buffers());
        queue.flush();
        assert_eq!(recorder.events.lock().unwrap().len(), 1);

        drop(recorder);
        slot.notify(|d| d.did_run_out_of_preview_buffers());
        queue.flush();
    }

    #[tokio::test]
    async fn test_tokio_channel_queue() {
        let (sender, mut receiver) = unbounded_channel::<Job>();
        let slot = DelegateSlot::default();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn CapturePipelineDelegate> = Arc::<Recorder>::downgrade(&recorder);
        slot.set(weak, Arc::new(sender));

        slot.notify(|d| d.did_stop_running(None));
        let job = receiver.recv().await.unwrap();
        job();
        assert_eq!(*recorder.events.lock().unwrap(), vec!["stop None".to_string()]);
    }
}
