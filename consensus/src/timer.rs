use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Election,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: TimeoutKind,
    pub generation: u64,
}

#[derive(Debug)]
pub struct TimerHandle {
    generation: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Single-shot timer that is recreated on every reset.
///
/// Every `start` bumps the generation. A fire that was already queued when the
/// timer got stopped or restarted carries an old generation and is rejected by
/// [`Timer::accept`].
#[derive(Debug)]
pub struct Timer {
    kind: TimeoutKind,
    generation: u64,
    events: mpsc::UnboundedSender<TimerEvent>,
    active: Option<TimerHandle>,
}

impl Timer {
    pub fn new(kind: TimeoutKind, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            kind,
            generation: 0,
            events,
            active: None,
        }
    }

    pub fn kind(&self) -> TimeoutKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_armed(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(&mut self, duration: Duration) {
        self.stop();
        self.generation += 1;

        let event = TimerEvent {
            kind: self.kind,
            generation: self.generation,
        };
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if events.send(event).is_err() {
                tracing::trace!(?event, "Timer fired after its receiver closed");
            }
        });

        tracing::trace!(kind = ?self.kind, generation = self.generation, ?duration, "Timer armed");
        self.active = Some(TimerHandle {
            generation: self.generation,
            task,
        });
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.cancel();
        }
    }

    /// Consumes a fire event. Returns false for stale or foreign events.
    pub fn accept(&mut self, event: &TimerEvent) -> bool {
        let current = event.kind == self.kind
            && self
                .active
                .as_ref()
                .is_some_and(|handle| handle.generation() == event.generation);
        if current {
            self.active = None;
        }
        current
    }
}
