//! Poll sequencer
//!
//! Walks the subscribed registers one request/response exchange at a time:
//!
//! ```text
//! Idle -> Requesting(reg) -> AwaitingResponse(reg, deadline)
//!      -> value | retry same reg | stale -> next reg ... -> CycleComplete -> Idle
//! ```
//!
//! The sequencer never blocks. The host calls [`PollSequencer::step`] from
//! its loop with the current time and the sequencer does whatever work is
//! possible without waiting.

use std::time::{Duration, Instant};

use errors::ServiceErrorTrait;
use tracing::{debug, info, warn};

use super::transport::Uart;
use crate::error::KmpError;
use crate::protocols::kmp::{
    DecodedValue, Destination, FrameCodec, FrameResult, RegisterDecoder, RegisterId,
};

/// Exchange settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub destination: Destination,
    /// Deadline for one response
    pub response_timeout: Duration,
    /// Extra attempts per register
    pub max_retries: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            destination: Destination::HeatMeter,
            response_timeout: Duration::from_millis(200),
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Requesting(RegisterId),
    AwaitingResponse {
        register: RegisterId,
        deadline: Instant,
    },
}

/// Progress of the running cycle
#[derive(Debug, Clone)]
pub struct PollCycleState {
    pub pending: Vec<RegisterId>,
    pub current_index: usize,
    pub retries_remaining: u8,
    pub last_error: Option<KmpError>,
    pub decoded: Vec<DecodedValue>,
    pub stale: Vec<(RegisterId, KmpError)>,
    pub anomalies: Vec<KmpError>,
    pub retries: u32,
    pub started_at: Instant,
}

/// Outcome of one finished cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Successful readings in polling order
    pub decoded: Vec<DecodedValue>,
    /// Registers that exhausted their retries, with the final error
    pub stale: Vec<(RegisterId, KmpError)>,
    /// Non-fatal diagnostics
    pub anomalies: Vec<KmpError>,
    pub retries: u32,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_stale(&self, register: RegisterId) -> bool {
        self.stale.iter().any(|(r, _)| *r == register)
    }

    pub fn value(&self, register: RegisterId) -> Option<&DecodedValue> {
        self.decoded.iter().find(|v| v.register == register)
    }
}

/// Lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    pub cycles: u64,
    pub values: u64,
    pub retries: u64,
    pub stale: u64,
    pub checksum_errors: u64,
    pub framing_errors: u64,
    pub timeouts: u64,
    pub malformed_payloads: u64,
    pub unexpected_units: u64,
    pub io_errors: u64,
}

impl PollStats {
    fn record_error(&mut self, error: &KmpError) {
        match error {
            KmpError::Checksum { .. } => self.checksum_errors += 1,
            KmpError::Framing(_) => self.framing_errors += 1,
            KmpError::Timeout { .. } => self.timeouts += 1,
            KmpError::MalformedPayload { .. } => self.malformed_payloads += 1,
            KmpError::UnexpectedUnit { .. } => self.unexpected_units += 1,
            KmpError::Io(_) => self.io_errors += 1,
            KmpError::Config(_) => {},
        }
    }
}

/// What a call to [`PollSequencer::step`] did
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// No cycle running
    Idle,
    /// Request written for this register
    Sent(RegisterId),
    /// Response still outstanding, call again later
    Waiting,
    /// Exchange failed, the same register will be requested again
    Retrying {
        register: RegisterId,
        error: KmpError,
    },
    Value(DecodedValue),
    /// Retries exhausted, moving on without a value
    Stale {
        register: RegisterId,
        error: KmpError,
    },
    CycleComplete(CycleReport),
}

impl StepOutcome {
    /// Whether the host should call `step` again right away
    pub fn has_more_work(&self) -> bool {
        !matches!(self, StepOutcome::Idle | StepOutcome::Waiting)
    }
}

/// Request/response state machine over one UART
#[derive(Debug)]
pub struct PollSequencer {
    config: PollConfig,
    codec: FrameCodec,
    decoder: RegisterDecoder,
    state: PollState,
    cycle: Option<PollCycleState>,
    stats: PollStats,
}

impl PollSequencer {
    pub fn new(config: PollConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.destination),
            decoder: RegisterDecoder::new(config.destination),
            config,
            state: PollState::Idle,
            cycle: None,
            stats: PollStats::default(),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub fn cycle(&self) -> Option<&PollCycleState> {
        self.cycle.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.cycle.is_some()
    }

    /// Begin a cycle over `registers`, returns false while one is running
    pub fn start_cycle(&mut self, registers: &[RegisterId], now: Instant) -> bool {
        if self.is_busy() {
            return false;
        }

        self.cycle = Some(PollCycleState {
            pending: registers.to_vec(),
            current_index: 0,
            retries_remaining: self.config.max_retries,
            last_error: None,
            decoded: Vec::with_capacity(registers.len()),
            stale: Vec::new(),
            anomalies: Vec::new(),
            retries: 0,
            started_at: now,
        });
        self.state = registers
            .first()
            .map_or(PollState::Idle, |&first| PollState::Requesting(first));

        debug!("[Poll] Cycle started with {} registers", registers.len());
        true
    }

    /// Do as much of the running cycle as possible without waiting
    pub fn step<U: Uart + ?Sized>(&mut self, uart: &mut U, now: Instant) -> StepOutcome {
        if self.cycle.is_none() {
            return StepOutcome::Idle;
        }

        match self.state {
            PollState::Idle => self.complete_cycle(now),
            PollState::Requesting(register) => self.send_request(uart, register, now),
            PollState::AwaitingResponse { register, deadline } => {
                self.poll_response(uart, register, deadline, now)
            },
        }
    }

    fn send_request<U: Uart + ?Sized>(
        &mut self,
        uart: &mut U,
        register: RegisterId,
        now: Instant,
    ) -> StepOutcome {
        self.codec.reset();

        // whatever arrived since the last exchange is noise
        if let Err(e) = uart.clear_input() {
            return self.fail_attempt(register, e);
        }

        let request = self.codec.build_request(register);
        if let Err(e) = uart.write_all(&request) {
            return self.fail_attempt(register, e);
        }

        self.state = PollState::AwaitingResponse {
            register,
            deadline: now + self.config.response_timeout,
        };
        debug!("[Poll] Requested {} (0x{:04X})", register, register.code());
        StepOutcome::Sent(register)
    }

    fn poll_response<U: Uart + ?Sized>(
        &mut self,
        uart: &mut U,
        register: RegisterId,
        deadline: Instant,
        now: Instant,
    ) -> StepOutcome {
        loop {
            let byte = match uart.read_byte() {
                Ok(Some(byte)) => byte,
                Ok(None) => break,
                Err(e) => return self.fail_attempt(register, e),
            };

            match self.codec.feed(byte) {
                FrameResult::Incomplete => {},
                FrameResult::Complete(frame) => {
                    return match self.decoder.decode(register, &frame.payload) {
                        Ok(value) => self.accept(value),
                        Err(e) => self.fail_attempt(register, e),
                    };
                },
                FrameResult::FramingError(reason) => {
                    return self.fail_attempt(register, KmpError::Framing(reason));
                },
                FrameResult::ChecksumError { expected, actual } => {
                    return self.fail_attempt(register, KmpError::Checksum { expected, actual });
                },
            }
        }

        if now >= deadline {
            let waited_ms = self.config.response_timeout.as_millis() as u64;
            return self.fail_attempt(
                register,
                KmpError::Timeout {
                    register,
                    waited_ms,
                },
            );
        }

        StepOutcome::Waiting
    }

    fn accept(&mut self, value: DecodedValue) -> StepOutcome {
        self.stats.values += 1;
        if let Some(cycle) = self.cycle.as_mut() {
            if !value.has_expected_unit() {
                let anomaly = KmpError::UnexpectedUnit {
                    register: value.register,
                    unit: value.unit,
                };
                self.stats.record_error(&anomaly);
                cycle.anomalies.push(anomaly);
            }
            cycle.decoded.push(value);
        }
        self.advance();
        StepOutcome::Value(value)
    }

    fn fail_attempt(&mut self, register: RegisterId, error: KmpError) -> StepOutcome {
        self.stats.record_error(&error);
        self.codec.reset();

        let Some(cycle) = self.cycle.as_mut() else {
            self.state = PollState::Idle;
            return StepOutcome::Idle;
        };
        cycle.last_error = Some(error.clone());

        if cycle.retries_remaining > 0 {
            cycle.retries_remaining -= 1;
            cycle.retries += 1;
            self.stats.retries += 1;
            debug!(
                "[Poll] {} failed ({}): {}, {} retries left",
                register,
                error.error_code(),
                error,
                cycle.retries_remaining
            );
            self.state = PollState::Requesting(register);
            return StepOutcome::Retrying { register, error };
        }

        self.stats.stale += 1;
        cycle.stale.push((register, error.clone()));
        warn!(
            "[Poll] {} stale after {} attempts: {}",
            register,
            u32::from(self.config.max_retries) + 1,
            error
        );
        self.advance();
        StepOutcome::Stale { register, error }
    }

    fn advance(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else {
            self.state = PollState::Idle;
            return;
        };
        cycle.current_index += 1;
        cycle.retries_remaining = self.config.max_retries;
        cycle.last_error = None;
        self.state = cycle
            .pending
            .get(cycle.current_index)
            .map_or(PollState::Idle, |&next| PollState::Requesting(next));
    }

    fn complete_cycle(&mut self, now: Instant) -> StepOutcome {
        self.state = PollState::Idle;
        let Some(cycle) = self.cycle.take() else {
            return StepOutcome::Idle;
        };
        self.stats.cycles += 1;

        let report = CycleReport {
            decoded: cycle.decoded,
            stale: cycle.stale,
            anomalies: cycle.anomalies,
            retries: cycle.retries,
            duration: now.saturating_duration_since(cycle.started_at),
        };

        if report.stale.is_empty() {
            debug!(
                "[Poll] Cycle {} complete: {} values, {} retries in {:?}",
                self.stats.cycles,
                report.decoded.len(),
                report.retries,
                report.duration
            );
        } else {
            info!(
                "[Poll] Cycle {} complete: {} values, {} stale, {} retries in {:?}",
                self.stats.cycles,
                report.decoded.len(),
                report.stale.len(),
                report.retries,
                report.duration
            );
        }

        StepOutcome::CycleComplete(report)
    }
}
