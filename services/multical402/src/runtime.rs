//! Host loop for the component
//!
//! A single-threaded cooperative loop: the update interval starts cycles, a
//! short step interval drives the running cycle, and the shutdown future
//! ends the loop. The component itself stays synchronous.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::core::{Multical402Component, PollStats, Uart};

/// Default period between `step` calls while a cycle is running
pub const DEFAULT_STEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub step_interval: Duration,
    /// Stop after this many completed cycles
    pub max_cycles: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            step_interval: DEFAULT_STEP_INTERVAL,
            max_cycles: None,
        }
    }
}

/// What the loop did before it returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub overruns: u64,
    pub stats: PollStats,
}

/// Run `component` until `shutdown` resolves or the cycle limit is reached
pub async fn run<U, F>(
    component: &mut Multical402Component<U>,
    options: RuntimeOptions,
    shutdown: F,
) -> RunSummary
where
    U: Uart,
    F: Future,
{
    let mut ticker = interval(component.update_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stepper = interval(options.step_interval);
    stepper.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        "Polling every {:?}{}",
        component.update_interval(),
        options
            .max_cycles
            .map(|n| format!(", stopping after {} cycles", n))
            .unwrap_or_default()
    );

    let mut cycles = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping poll loop");
                break;
            }
            _ = ticker.tick() => {
                component.on_poll_tick(Instant::now().into_std());
            }
            _ = stepper.tick(), if component.is_polling() => {}
        }

        if component.step(Instant::now().into_std()).is_some() {
            cycles += 1;
            debug!("Completed {} poll cycles", cycles);
            if options.max_cycles.is_some_and(|max| cycles >= max) {
                info!("Reached cycle limit ({})", cycles);
                break;
            }
        }
    }

    RunSummary {
        cycles,
        overruns: component.overruns(),
        stats: component.stats().clone(),
    }
}
