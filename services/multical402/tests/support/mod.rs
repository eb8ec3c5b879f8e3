//! Test Support Utilities
//!
//! A scripted UART that replays canned meter replies, plus helpers to drive
//! a component through whole poll cycles on a synthetic clock.

#![allow(dead_code)]

pub mod scripted_uart;

pub use scripted_uart::*;

use std::time::{Duration, Instant};

use multical402::core::{CycleReport, Multical402Component, Uart};

/// Time added whenever the component has to wait for a reply
pub const WAIT_STEP: Duration = Duration::from_millis(250);

/// Start a cycle at `start` and step it to completion
pub fn poll_once<U: Uart>(
    component: &mut Multical402Component<U>,
    start: Instant,
) -> (CycleReport, Instant) {
    assert!(component.on_poll_tick(start), "cycle already running");
    let mut now = start;
    for _ in 0..100 {
        if let Some(report) = component.step(now) {
            return (report, now);
        }
        now += WAIT_STEP;
    }
    panic!("poll cycle did not complete");
}
