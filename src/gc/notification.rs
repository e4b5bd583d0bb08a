use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

const MIN_DURATION: Duration = Duration::from_nanos(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GcAction {
    EndOfPause,
    EndOfCycle,
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcAction::EndOfPause => "end of GC pause",
            GcAction::EndOfCycle => "end of GC cycle",
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct GcNotification {
    pub gc_name: String,
    pub action: GcAction,
    pub cause: String,
    /// id of the cycle; pauses carry the id of the cycle they belong to
    pub id: u64,
    /// start, relative to the creation of the notifier
    pub start: Duration,
    pub duration: Duration,
}

impl fmt::Display for GcNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} {} ({}) at {:?}, took {:?}", self.gc_name, self.id, self.action, self.cause, self.start, self.duration)
    }
}

pub trait GcListener: Send + Sync {
    fn notify(&self, n: &GcNotification);
}

impl<F: Fn(&GcNotification) + Send + Sync> GcListener for F {
    fn notify(&self, n: &GcNotification) {
        self(n)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GcSummary {
    pub pause_count: u64,
    pub total_pause: Duration,
    pub cycle_count: u64,
}

/// Emits pause and cycle notifications for one collector.
pub struct GcNotifier {
    gc_name: String,
    epoch: Instant,
    next_id: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn GcListener>>>,
    summary: Mutex<GcSummary>,
}

impl fmt::Debug for GcNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcNotifier")
            .field("gc_name", &self.gc_name)
            .field("summary", &self.summary())
            .finish_non_exhaustive()
    }
}

impl GcNotifier {
    pub fn new(gc_name: &str) -> Self {
        GcNotifier {
            gc_name: gc_name.to_string(),
            epoch: Instant::now(),
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            summary: Mutex::new(GcSummary::default()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn GcListener>) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    pub fn summary(&self) -> GcSummary {
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_cycle(&self, cause: &str) -> GcCycle<'_> {
        GcCycle {
            notifier: self,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cause: cause.to_string(),
            start: Instant::now(),
            longest_pause: Duration::ZERO,
        }
    }

    fn emit(&self, action: GcAction, cause: &str, id: u64, start: Instant, duration: Duration) -> GcNotification {
        let n = GcNotification {
            gc_name: self.gc_name.clone(),
            action,
            cause: cause.to_string(),
            id,
            start: start.saturating_duration_since(self.epoch),
            duration: duration.max(MIN_DURATION),
        };
        {
            let mut s = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
            match action {
                GcAction::EndOfPause => {
                    s.pause_count += 1;
                    s.total_pause += n.duration;
                }
                GcAction::EndOfCycle => s.cycle_count += 1,
            }
        }
        log::debug!("{n}");
        for l in self.listeners.read().unwrap_or_else(PoisonError::into_inner).iter() {
            l.notify(&n);
        }
        n
    }
}

/// A running collection cycle. Pauses are recorded inside it; [`GcCycle::finish`] reports
/// the cycle, never shorter than its longest pause.
pub struct GcCycle<'a> {
    notifier: &'a GcNotifier,
    id: u64,
    cause: String,
    start: Instant,
    longest_pause: Duration,
}

impl GcCycle<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs `f` as a stop-the-world pause of this cycle.
    pub fn pause<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let r = f();
        self.record_pause(start, start.elapsed());
        r
    }

    pub fn record_pause(&mut self, start: Instant, duration: Duration) -> GcNotification {
        let n = self.notifier.emit(GcAction::EndOfPause, &self.cause, self.id, start, duration);
        self.longest_pause = self.longest_pause.max(n.duration);
        n
    }

    pub fn finish(self) -> GcNotification {
        let duration = self.start.elapsed().max(self.longest_pause);
        self.notifier.emit(GcAction::EndOfCycle, &self.cause, self.id, self.start, duration)
    }
}
