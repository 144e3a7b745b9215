//! MapKit Scheduler Library
//!
//! Cooperative, priority-preemptive, time-sliced task scheduler.
//!
//! Long-running work (tile decoding, label placement, style evaluation) is
//! split into tasks whose `exec` callback does one small chunk at a time.
//! The scheduler runs those chunks inside a single run loop that hands
//! control back to the host whenever the tick budget is spent, so the host
//! stays responsive. Tasks are organized in priority lanes (higher value is
//! more urgent) with FIFO ordering within each lane, and a more urgent task
//! takes over at the next chunk boundary.
//!
//! Tasks can be chained into a [`TaskSequence`] whose stages run back to
//! back, each taking over the scheduler directly from the previous one.
//!
//! # Example
//!
//! ```
//! use mapkit_scheduler::{EventLoop, ManualClock, SchedulerConfig, Step, TaskManager, TaskSpec};
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let clock = Rc::new(ManualClock::new());
//! let host = EventLoop::new(clock.clone());
//! let config = SchedulerConfig::default().with_tick_budget(Duration::from_millis(16));
//! let manager = TaskManager::new(config, Rc::new(host.clone()), clock.clone());
//!
//! // Decode 8 rows at 3ms each; the 16ms budget forces one yield to the host
//! let ticker = clock.clone();
//! let decode = manager
//!     .create(
//!         TaskSpec::from_fns(
//!             "decode-tile",
//!             |rows: u32| Ok((rows, 0u32)),
//!             move |(rows, done): &mut (u32, u32)| {
//!                 ticker.advance(Duration::from_millis(3));
//!                 *done += 1;
//!                 Ok(if done == rows { Step::Done } else { Step::Continue })
//!             },
//!             |(_, done): (u32, u32)| Ok(done),
//!         )
//!         .with_priority(5),
//!     )
//!     .unwrap();
//!
//! let mut handle = decode.start(8).unwrap();
//! assert_eq!(host.run(), 2);
//! assert_eq!(handle.try_result().unwrap().unwrap(), 8);
//! ```

mod clock;
mod config;
mod error;
mod frame_budget;
mod host;
mod priority;
mod registry;
mod scheduler;
mod sequence;
mod task;

// Re-export public API
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, SchedulerConfig, DEFAULT_MAX_PRIORITY_LANES, DEFAULT_TICK_BUDGET,
    ENV_MAX_LANES, ENV_TICK_BUDGET_MS, ENV_TIME_QUOTA_MS,
};
pub use error::{SchedulerError, TaskError};
pub use host::{Continuation, EventLoop, Host, TokioHost};
pub use priority::{Lanes, PriorityLane};
pub use registry::SchedulerRegistry;
pub use scheduler::{SchedulerStats, TaskManager};
pub use sequence::{TaskSequence, TaskSequenceBuilder};
pub use task::{FnWork, Step, Task, TaskHandle, TaskId, TaskSpec, TaskState, Work};
