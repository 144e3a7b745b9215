//! Scripted scheduling scenarios replayed on a virtual clock
//!
//! Each scenario builds a fresh scheduler over an [`EventLoop`] driven by a
//! [`ManualClock`]. Every `exec` call advances the clock by its cost, so the
//! replay is deterministic and takes no wall time.

use anyhow::{Context, Result};
use clap::ValueEnum;
use mapkit_scheduler::{
    EventLoop, FnWork, ManualClock, SchedulerConfig, SchedulerStats, Step, TaskManager,
    TaskSequence, TaskSpec,
};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Named scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// One task overrunning a 2ms quota; a host timer slips in
    QuotaYield,
    /// The same task with a 100ms quota; the timer waits until the end
    QuotaNoYield,
    /// A 20ms tick budget forces yields within a generous quota
    TickBudget,
    /// Two equal-priority tasks keep FIFO order across tick yields
    EqualPriorityFifo,
    /// Sequence stages arbitrated against a mid-priority task
    SequencePriority,
    /// Sequence continuation runs ahead of equal-priority work
    SequenceContinuation,
}

/// Recorded outcome of a replay
#[derive(Debug, Serialize)]
pub struct Replay {
    pub scenario: Scenario,
    pub events: Vec<String>,
    #[serde(skip)]
    pub stats: SchedulerStats,
}

impl Scenario {
    /// Run the scenario to completion
    pub fn replay(self) -> Result<Replay> {
        tracing::debug!(scenario = ?self, "replaying scenario");
        let bench = match self {
            Scenario::QuotaYield => single_task(Some(ms(2)), None, 5, ms(6))?,
            Scenario::QuotaNoYield => single_task(Some(ms(100)), None, 5, ms(6))?,
            Scenario::TickBudget => single_task(Some(ms(200)), Some(ms(20)), 8, ms(10))?,
            Scenario::EqualPriorityFifo => equal_priority_fifo()?,
            Scenario::SequencePriority => sequence(5, 1, 3)?,
            Scenario::SequenceContinuation => sequence(3, 3, 3)?,
        };
        bench.host.run();

        let events = bench.log.borrow().clone();
        Ok(Replay {
            scenario: self,
            events,
            stats: bench.manager.stats(),
        })
    }
}

type Log = Rc<RefCell<Vec<String>>>;

struct Bench {
    clock: ManualClock,
    host: EventLoop,
    manager: TaskManager,
    log: Log,
}

impl Bench {
    fn new(config: SchedulerConfig) -> Self {
        let clock = ManualClock::new();
        let host = EventLoop::new(Rc::new(clock.clone()));
        let manager = TaskManager::new(config, Rc::new(host.clone()), Rc::new(clock.clone()));
        Self {
            clock,
            host,
            manager,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Task of `execs` exec calls costing `cost` each
    fn task(&self, name: &'static str, execs: u32, cost: Duration) -> TaskSpec<FnWork<u32, u32, u32>> {
        let clock = self.clock.clone();
        let exec_log = self.log.clone();
        let done_log = self.log.clone();
        TaskSpec::from_fns(
            name,
            |_: u32| Ok(0),
            move |count: &mut u32| {
                clock.advance(cost);
                *count += 1;
                exec_log.borrow_mut().push(format!("{name}-exec"));
                Ok(if *count >= execs { Step::Done } else { Step::Continue })
            },
            move |count: u32| {
                done_log.borrow_mut().push(format!("{name}-done"));
                Ok(count)
            },
        )
    }

    /// Competing host work
    fn timer(&self, delay: Duration) {
        let log = self.log.clone();
        self.host
            .set_timeout(delay, move || log.borrow_mut().push("timer".to_string()));
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn single_task(quota: Option<Duration>, tick_budget: Option<Duration>, execs: u32, cost: Duration) -> Result<Bench> {
    let mut config = SchedulerConfig::default();
    if let Some(budget) = tick_budget {
        config = config.with_tick_budget(budget);
    }
    let bench = Bench::new(config);

    let mut spec = bench.task("task", execs, cost);
    if let Some(quota) = quota {
        spec = spec.with_time_quota(quota);
    }
    bench.manager.create(spec)?.start(0)?;
    bench.timer(ms(2));
    Ok(bench)
}

fn equal_priority_fifo() -> Result<Bench> {
    let bench = Bench::new(SchedulerConfig::default().with_tick_budget(ms(20)));

    for name in ["task1", "task2"] {
        bench
            .manager
            .create(bench.task(name, 5, ms(10)).with_priority(1))?
            .start(0)
            .with_context(|| format!("failed to start {name}"))?;
    }
    bench.timer(ms(2));
    Ok(bench)
}

fn sequence(first: u32, second: u32, independent: u32) -> Result<Bench> {
    let bench = Bench::new(SchedulerConfig::default());

    let log = bench.log.clone();
    let pipeline = TaskSequence::builder("pipeline")
        .stage(bench.task("stage1", 1, ms(1)).with_priority(first))
        .stage(bench.task("stage2", 1, ms(1)).with_priority(second))
        .on_done(move |_| log.borrow_mut().push("sequence-done".to_string()))
        .build(&bench.manager);

    pipeline.start(0)?;
    bench
        .manager
        .create(bench.task("independent", 1, ms(1)).with_priority(independent))?
        .start(0)?;
    Ok(bench)
}
