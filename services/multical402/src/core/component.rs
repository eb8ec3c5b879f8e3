//! Multical 402 component
//!
//! Binds the poll sequencer to the host: a periodic tick starts a cycle,
//! the host loop calls [`Multical402Component::step`], and once a cycle
//! completes every configured sensor with a known value is published.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use common::serde_helpers::format_duration;
use tracing::{debug, info, warn};

use super::sequencer::{CycleReport, PollConfig, PollSequencer, PollStats, StepOutcome};
use super::transport::Uart;
use crate::protocols::kmp::{DecodedValue, RegisterId};

/// Host side sink for published values
pub trait Sensor {
    fn publish_state(&mut self, value: f64);
}

impl<F: FnMut(f64)> Sensor for F {
    fn publish_state(&mut self, value: f64) {
        self(value)
    }
}

pub struct Multical402Component<U: Uart> {
    uart: U,
    sequencer: PollSequencer,
    /// Ordered by register, which is polling order
    sensors: BTreeMap<RegisterId, Box<dyn Sensor>>,
    cache: HashMap<RegisterId, DecodedValue>,
    update_interval: Duration,
    last_report: Option<CycleReport>,
    overruns: u64,
    publish_count: u64,
}

impl<U: Uart> std::fmt::Debug for Multical402Component<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multical402Component")
            .field("sensors", &self.sensors.keys().collect::<Vec<_>>())
            .field("cached", &self.cache.len())
            .field("update_interval", &self.update_interval)
            .field("state", &self.sequencer.state())
            .field("overruns", &self.overruns)
            .finish()
    }
}

impl<U: Uart> Multical402Component<U> {
    pub fn new(uart: U, poll: PollConfig, update_interval: Duration) -> Self {
        Self {
            uart,
            sequencer: PollSequencer::new(poll),
            sensors: BTreeMap::new(),
            cache: HashMap::new(),
            update_interval,
            last_report: None,
            overruns: 0,
            publish_count: 0,
        }
    }

    /// Attach the sensor for `register`, replacing any previous one
    pub fn set_sensor(&mut self, register: RegisterId, sensor: impl Sensor + 'static) {
        self.sensors.insert(register, Box::new(sensor));
    }

    /// Registers with a sensor, in polling order
    pub fn subscribed(&self) -> Vec<RegisterId> {
        self.sensors.keys().copied().collect()
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn setup(&mut self) {
        info!("Setting up Multical402...");
        if self.sensors.is_empty() {
            warn!("No sensors configured, poll cycles will be empty");
        }
    }

    pub fn dump_config(&self) {
        let poll = self.sequencer.config();
        info!("Multical402:");
        info!("  Update Interval: {}", format_duration(self.update_interval));
        info!("  Destination: {}", poll.destination);
        info!(
            "  Response Timeout: {}, Max Retries: {}",
            format_duration(poll.response_timeout),
            poll.max_retries
        );
        for register in self.sensors.keys() {
            let request = register.request();
            info!(
                "  Sensor '{}': register 0x{:04X}, unit '{}', accuracy {}",
                request.label, request.command_code, request.sensor_unit, request.accuracy_decimals
            );
        }
    }

    /// Scheduler entry point, returns false when the tick was an overrun
    pub fn on_poll_tick(&mut self, now: Instant) -> bool {
        let registers = self.subscribed();
        if self.sequencer.start_cycle(&registers, now) {
            return true;
        }

        self.overruns += 1;
        warn!(
            "Poll tick while a cycle is still running, skipped ({} overruns)",
            self.overruns
        );
        false
    }

    /// Drive the running cycle until it has to wait, returns its report once done
    pub fn step(&mut self, now: Instant) -> Option<CycleReport> {
        loop {
            let outcome = self.sequencer.step(&mut self.uart, now);
            match outcome {
                StepOutcome::Value(value) => {
                    self.cache.insert(value.register, value);
                },
                StepOutcome::CycleComplete(report) => {
                    self.publish();
                    self.last_report = Some(report.clone());
                    return Some(report);
                },
                ref other if !other.has_more_work() => return None,
                _ => {},
            }
        }
    }

    fn publish(&mut self) {
        for (register, sensor) in self.sensors.iter_mut() {
            let Some(value) = self.cache.get(register) else {
                continue;
            };
            let request = register.request();
            debug!(
                "'{}': Sending state {:.*} {}",
                request.label,
                request.accuracy_decimals as usize,
                value.value,
                request.sensor_unit
            );
            sensor.publish_state(value.value);
        }
        self.publish_count += 1;
    }

    /// Last successfully decoded value for `register`
    pub fn get(&self, register: RegisterId) -> Option<DecodedValue> {
        self.cache.get(&register).copied()
    }

    pub fn is_polling(&self) -> bool {
        self.sequencer.is_busy()
    }

    pub fn stats(&self) -> &PollStats {
        self.sequencer.stats()
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Completed publish rounds
    pub fn publish_count(&self) -> u64 {
        self.publish_count
    }

    pub fn uart(&self) -> &U {
        &self.uart
    }

    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }
}
