use std::sync::{
    Arc, Mutex, PoisonError,
    mpsc::{self, Receiver, Sender, TryRecvError},
};

pub type Callback = Box<dyn FnOnce() + Send>;
pub type Handler = Arc<dyn Fn() + Send + Sync>;

/// Decides which thread runs notification callbacks.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, callback: Callback);
}

/// Runs callbacks immediately on the calling thread.
#[derive(Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, callback: Callback) {
        callback();
    }
}

/// Queues callbacks for whichever thread owns the matching [`DispatchQueue`].
///
/// Callbacks sent after the queue is gone are dropped.
#[derive(Clone)]
pub struct ChannelDispatcher {
    sender: Sender<Callback>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::channel();
        (
            Self { sender: tx },
            DispatchQueue { receiver: rx },
        )
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, callback: Callback) {
        let _ = self.sender.send(callback);
    }
}

pub struct DispatchQueue {
    receiver: Receiver<Callback>,
}

impl DispatchQueue {
    /// Runs every queued callback; returns how many ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(callback) => {
                    callback();
                    ran += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Blocks until one callback arrives and runs it. Returns `false` once
    /// every dispatcher is gone.
    pub fn run_next(&self) -> bool {
        match self.receiver.recv() {
            Ok(callback) => {
                callback();
                true
            }
            Err(_) => false,
        }
    }
}

/// A list of observers notified through a [`Dispatcher`].
pub struct Event {
    handlers: Mutex<Vec<Handler>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Event {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            dispatcher,
        }
    }

    pub fn subscribe(&self, handler: Handler) {
        lock(&self.handlers).push(handler);
    }

    pub fn raise(&self) {
        let handlers = lock(&self.handlers).clone();
        if handlers.is_empty() {
            return;
        }
        self.dispatcher.dispatch(Box::new(move || {
            for handler in &handlers {
                handler();
            }
        }));
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(Arc::new(InlineDispatcher))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
