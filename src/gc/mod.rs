//! Bookkeeping for garbage collection pauses and the CPU time spent by GC threads.
//! Collector threads write, any thread may read.

pub mod counter;
pub mod cpu_time;
pub mod notification;

pub use counter::PublishedCounter;
pub use cpu_time::{thread_cpu_time_nanos, CpuTimeGroup, GcCpuTime};
pub use notification::{GcAction, GcCycle, GcListener, GcNotification, GcNotifier, GcSummary};
