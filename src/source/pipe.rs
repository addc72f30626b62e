use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use crossbeam_queue::SegQueue;

use crate::flow::{
    Demand, FlowError, FuseMode, FusedQueue, Handle, Publisher, Subscriber, Subscription,
};
use crate::source::fail::Noop;

const PLAIN: u8 = 0;
const FUSED_ASYNC: u8 = 1;

/// Unicast push processor: a hot sequence fed imperatively.
///
/// One producer side ([`push`](Pipe::push) / [`complete`](Pipe::complete) /
/// [`fail`](Pipe::fail)), one subscriber. Values buffer in an unbounded
/// queue until the subscriber consumes them.
///
/// The subscription grants ASYNC fusion: a fused consumer reads the queue
/// directly and is nudged with `on_ready` after every push. An unfused
/// consumer is served by a demand-driven emission loop instead.
pub struct Pipe<T> {
    core: Arc<PipeCore<T>>,
}

/// Creates an unattached pipe. Values pushed before a subscriber arrives
/// are buffered.
pub fn pipe<T: Send + 'static>() -> Pipe<T> {
    Pipe {
        core: Arc::new(PipeCore {
            queue: SegQueue::new(),
            downstream: Mutex::new(None),
            error: Mutex::new(None),
            done: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            requested: Demand::new(),
            wip: AtomicUsize::new(0),
            mode: AtomicU8::new(PLAIN),
        }),
    }
}

impl<T: Send + 'static> Pipe<T> {
    /// Feeds one value. Returns it back once the pipe is terminated or the
    /// subscriber cancelled.
    pub fn push(&self, value: T) -> Result<(), T> {
        self.core.push(value)
    }

    /// Terminates the pipe successfully. Buffered values are still
    /// delivered first.
    pub fn complete(&self) {
        self.core.terminate(None)
    }

    /// Terminates the pipe with an error.
    pub fn fail(&self, err: FlowError) {
        self.core.terminate(Some(err))
    }
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for Pipe<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        {
            let mut slot = self
                .core
                .downstream
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                drop(slot);
                subscriber.on_subscribe(Handle::Plain(Arc::new(Noop)));
                subscriber.on_error(FlowError::message("pipe already has a subscriber"));
                return;
            }
            *slot = Some(subscriber.clone());
        }
        subscriber.on_subscribe(Handle::Fused(self.core.clone()));
        self.core.after_subscribe();
    }
}

struct PipeCore<T> {
    queue: SegQueue<T>,
    downstream: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    error: Mutex<Option<FlowError>>,
    done: AtomicBool,
    terminal_sent: AtomicBool,
    cancelled: AtomicBool,
    requested: Demand,
    /// Non-zero while the plain-mode emission loop is running or queued.
    wip: AtomicUsize,
    mode: AtomicU8,
}

impl<T: Send + 'static> PipeCore<T> {
    fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_error(&self) -> Option<FlowError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn push(&self, value: T) -> Result<(), T> {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return Err(value);
        }
        self.queue.push(value);
        match self.mode.load(Ordering::Acquire) {
            FUSED_ASYNC => {
                if let Some(s) = self.subscriber() {
                    s.on_ready();
                }
            }
            _ => self.drain(),
        }
        Ok(())
    }

    fn terminate(&self, err: Option<FlowError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            if let Some(e) = err {
                log::warn!("pipe terminated twice, dropping error: {e}");
            }
            return;
        }
        if let Some(e) = err {
            *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
        }
        match self.mode.load(Ordering::Acquire) {
            FUSED_ASYNC => self.deliver_terminal(),
            _ => self.drain(),
        }
    }

    /// Fused mode: terminal signals bypass the queue. The consumer keeps
    /// polling buffered values after `on_complete`, so nothing is lost.
    fn deliver_terminal(&self) {
        let Some(s) = self.subscriber() else { return };
        if self.terminal_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.take_error() {
            Some(e) => s.on_error(e),
            None => s.on_complete(),
        }
    }

    fn after_subscribe(&self) {
        match self.mode.load(Ordering::Acquire) {
            FUSED_ASYNC => {
                if let Some(s) = self.subscriber()
                    && !self.queue.is_empty()
                {
                    s.on_ready();
                }
                if self.done.load(Ordering::Acquire) {
                    self.deliver_terminal();
                }
            }
            _ => self.drain(),
        }
    }

    /// Plain-mode emission loop, serialized by `wip`.
    fn drain(&self) {
        let Some(sub) = self.subscriber() else { return };
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                while self.queue.pop().is_some() {}
            } else {
                let requested = self.requested.get();
                let mut emitted = 0u64;
                while emitted < requested {
                    match self.queue.pop() {
                        Some(v) => {
                            sub.on_next(v);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.requested.sub(emitted);
                }
                if self.done.load(Ordering::Acquire)
                    && self.queue.is_empty()
                    && !self.terminal_sent.swap(true, Ordering::AcqRel)
                {
                    match self.take_error() {
                        Some(e) => sub.on_error(e),
                        None => sub.on_complete(),
                    }
                }
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Subscription for PipeCore<T> {
    fn request(&self, n: u64) {
        if self.mode.load(Ordering::Acquire) == FUSED_ASYNC {
            // Fused consumers own the queue; demand signalling is moot.
            return;
        }
        if n == 0 {
            if !self.done.swap(true, Ordering::AcqRel)
                && !self.terminal_sent.swap(true, Ordering::AcqRel)
                && let Some(s) = self.subscriber()
            {
                s.on_error(FlowError::bad_request());
            }
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if self.mode.load(Ordering::Acquire) != FUSED_ASYNC {
            self.drain();
        }
    }
}

impl<T: Send + 'static> FusedQueue<T> for PipeCore<T> {
    fn request_fusion(&self, requested: FuseMode) -> FuseMode {
        match requested {
            FuseMode::Async | FuseMode::Any => {
                self.mode.store(FUSED_ASYNC, Ordering::Release);
                FuseMode::Async
            }
            _ => FuseMode::None,
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        Ok(self.queue.pop())
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}
