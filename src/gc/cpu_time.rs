use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

use crate::{compiler::config::OptoConfig, gc::counter::PublishedCounter};

/// Thread groups whose CPU time is accounted separately.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CpuTimeGroup {
    ParallelWorkers,
    ConcurrentMark,
    ConcurrentRefine,
    Service,
}

impl CpuTimeGroup {
    pub const COUNT: usize = 4;
    pub const ALL: [CpuTimeGroup; Self::COUNT] =
        [CpuTimeGroup::ParallelWorkers, CpuTimeGroup::ConcurrentMark, CpuTimeGroup::ConcurrentRefine, CpuTimeGroup::Service];

    #[inline]
    pub const fn ix(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CpuTimeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuTimeGroup::ParallelWorkers => "gc_parallel_workers",
            CpuTimeGroup::ConcurrentMark => "gc_conc_mark",
            CpuTimeGroup::ConcurrentRefine => "gc_conc_refine",
            CpuTimeGroup::Service => "gc_service",
        })
    }
}

/// CPU time consumed by the calling thread, `None` where the platform cannot tell.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn thread_cpu_time_nanos() -> Option<i64> {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::ThreadCPUTime);
    Some(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn thread_cpu_time_nanos() -> Option<i64> {
    None
}

pub fn thread_cpu_time_supported() -> bool {
    thread_cpu_time_nanos().is_some()
}

/// Per-group GC CPU time plus a published total. When disabled every query returns
/// [`PublishedCounter::UNAVAILABLE`].
#[derive(Debug)]
pub struct GcCpuTime {
    enabled: bool,
    groups: [AtomicI64; CpuTimeGroup::COUNT],
    total: PublishedCounter,
}

impl GcCpuTime {
    pub fn new(conf: &OptoConfig) -> Self {
        Self::with_support(conf.use_perf_data, thread_cpu_time_supported())
    }

    pub fn with_support(use_perf_data: bool, supported: bool) -> Self {
        let enabled = use_perf_data && supported;
        if use_perf_data && !supported {
            log::info!("thread CPU time is not available, GC CPU time will not be reported");
        }
        GcCpuTime {
            enabled,
            groups: Default::default(),
            total: if enabled { PublishedCounter::new(0) } else { PublishedCounter::unavailable() },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&self, group: CpuTimeGroup, nanos: i64) {
        if self.enabled && nanos > 0 {
            self.groups[group.ix()].fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// Runs `f` and charges the CPU time of the calling thread to `group`.
    pub fn measure<R>(&self, group: CpuTimeGroup, f: impl FnOnce() -> R) -> R {
        if !self.enabled {
            return f();
        }
        let start = thread_cpu_time_nanos();
        let r = f();
        if let (Some(start), Some(end)) = (start, thread_cpu_time_nanos()) {
            self.add(group, end - start);
        }
        r
    }

    pub fn group(&self, group: CpuTimeGroup) -> i64 {
        if self.enabled {
            self.groups[group.ix()].load(Ordering::Relaxed)
        } else {
            PublishedCounter::UNAVAILABLE
        }
    }

    /// Publishes the sum over all groups. Readers of [`GcCpuTime::total`] see it afterwards.
    pub fn publish_total(&self) -> i64 {
        if !self.enabled {
            return PublishedCounter::UNAVAILABLE;
        }
        let sum = CpuTimeGroup::ALL.iter().map(|&g| self.group(g)).sum();
        let total = self.total.publish(sum);
        log::trace!("GC CPU time: {total} ns");
        total
    }

    pub fn total(&self) -> i64 {
        self.total.get()
    }
}
