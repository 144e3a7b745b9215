//! Driving the scheduler from a tokio `LocalSet`

use mapkit_scheduler::{
    SchedulerConfig, Step, SystemClock, TaskError, TaskManager, TaskSequence, TaskSpec, TokioHost,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;

fn manager() -> TaskManager {
    let config = SchedulerConfig::default().with_tick_budget(Duration::from_millis(5));
    TaskManager::new(config, Rc::new(TokioHost), Rc::new(SystemClock::new()))
}

#[tokio::test(flavor = "current_thread")]
async fn test_await_task_result() {
    LocalSet::new()
        .run_until(async {
            let manager = manager();
            let task = manager
                .create(TaskSpec::from_fns(
                    "triangle",
                    |n: u64| Ok((n, 0u64)),
                    |(n, total): &mut (u64, u64)| {
                        *total += *n;
                        *n -= 1;
                        Ok(if *n == 0 { Step::Done } else { Step::Continue })
                    },
                    |(_, total): (u64, u64)| Ok(total),
                ))
                .unwrap();

            let total = task.start(100).unwrap().await.unwrap();
            assert_eq!(total, 5050);
            assert!(manager.is_idle());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_other_futures_interleave_with_long_task() {
    LocalSet::new()
        .run_until(async {
            let manager = manager();
            let log = Rc::new(RefCell::new(Vec::new()));

            let exec_log = log.clone();
            let task = manager
                .create(TaskSpec::from_fns(
                    "slow",
                    |_: ()| Ok(0u32),
                    move |n: &mut u32| {
                        std::thread::sleep(Duration::from_millis(2));
                        *n += 1;
                        exec_log.borrow_mut().push("exec");
                        Ok(if *n >= 10 { Step::Done } else { Step::Continue })
                    },
                    |n: u32| Ok(n),
                ))
                .unwrap();
            let handle = task.start(()).unwrap();

            let side_log = log.clone();
            let side = tokio::task::spawn_local(async move {
                side_log.borrow_mut().push("side");
            });

            assert_eq!(handle.await.unwrap(), 10);
            side.await.unwrap();

            assert!(log.borrow().contains(&"side"));
            // 10 execs of at least 2ms against a 5ms budget
            assert!(manager.stats().ticks >= 3);
            assert!(manager.stats().yields >= 2);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_await_sequence_and_failure() {
    LocalSet::new()
        .run_until(async {
            let manager = manager();

            let add = |name: &'static str, k: i64| {
                TaskSpec::from_fns(name, |n: i64| Ok(n), |_: &mut i64| Ok(Step::Done), move |n: i64| Ok(n + k))
            };
            let sequence = TaskSequence::builder("adds")
                .stage(add("plus-one", 1))
                .stage(add("plus-ten", 10))
                .build(&manager);
            assert_eq!(sequence.start(0).unwrap().await.unwrap(), vec![1, 11]);

            let failing = manager
                .create(TaskSpec::from_fns(
                    "failing",
                    |_: ()| Ok(()),
                    |_: &mut ()| -> anyhow::Result<Step> { anyhow::bail!("no tiles") },
                    |_: ()| Ok(()),
                ))
                .unwrap();
            let err = failing.start(()).unwrap().await.unwrap_err();
            assert!(matches!(err, TaskError::Failed { .. }));
        })
        .await;
}
