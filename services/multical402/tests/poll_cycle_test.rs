//! Poll cycle behaviour through the public component API

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use multical402::core::{Multical402Component, PollConfig, StepOutcome};
use multical402::error::KmpError;
use multical402::protocols::kmp::codec::build_frame;
use multical402::protocols::kmp::constants::RESPONSE_START;
use multical402::protocols::kmp::{
    build_request, encode_register_response, DecodedValue, Destination, MeterSimulator,
    RegisterDecoder, RegisterId, SimulatorFault, Unit, REGISTERS,
};
use support::{poll_once, Reply, ScriptedUart};

type Published = Rc<RefCell<Vec<(RegisterId, f64)>>>;

fn record(published: &Published, register: RegisterId) -> impl FnMut(f64) + 'static {
    let sink = published.clone();
    move |v: f64| sink.borrow_mut().push((register, v))
}

fn simulated(registers: &[RegisterId]) -> (Multical402Component<MeterSimulator>, Published) {
    let published = Published::default();
    let mut component = Multical402Component::new(
        MeterSimulator::with_default_readings(Destination::HeatMeter),
        PollConfig::default(),
        Duration::from_secs(60),
    );
    for &register in registers {
        component.set_sensor(register, record(&published, register));
    }
    (component, published)
}

fn energy_frame() -> Vec<u8> {
    // raw 123456 = 0x0001E240, SI-EX 0x43 = exponent -3, unit 3 = MWh
    build_frame(
        RESPONSE_START,
        &[0x3F, 0x10, 0x00, 0x3C, 0x03, 0x04, 0x43, 0x00, 0x01, 0xE2, 0x40],
    )
}

#[test]
fn energy_reading_scales_to_mwh() {
    let uart = ScriptedUart::new([Reply::Bytes(energy_frame())]);
    let published = Published::default();
    let mut component =
        Multical402Component::new(uart, PollConfig::default(), Duration::from_secs(60));
    component.set_sensor(RegisterId::Energy, record(&published, RegisterId::Energy));

    let (report, _) = poll_once(&mut component, Instant::now());

    let value = component.get(RegisterId::Energy).unwrap();
    assert_eq!(value.raw, 123_456);
    assert_eq!(value.exponent, -3);
    assert_eq!(value.unit, Unit::MWh);
    assert_eq!(value.value, 123.456);
    assert_eq!(report.decoded, vec![value]);
    assert_eq!(*published.borrow(), vec![(RegisterId::Energy, 123.456)]);
    assert_eq!(
        component.uart().written(),
        &[build_request(Destination::HeatMeter, RegisterId::Energy)]
    );
}

#[test]
fn two_checksum_errors_then_valid_flow() {
    let (mut component, published) = simulated(&[RegisterId::Flow]);
    component.uart_mut().script(
        RegisterId::Flow,
        [SimulatorFault::CorruptChecksum, SimulatorFault::CorruptChecksum],
    );

    let (report, _) = poll_once(&mut component, Instant::now());

    assert_eq!(report.retries, 2);
    assert!(report.stale.is_empty());
    assert_eq!(component.stats().checksum_errors, 2);
    assert_eq!(component.uart().served().len(), 3);
    // published once, with the value from the third attempt
    assert_eq!(*published.borrow(), vec![(RegisterId::Flow, 245.0)]);
    assert_eq!(component.publish_count(), 1);
}

#[test]
fn one_register_timing_out_does_not_block_the_cycle() {
    let (mut component, published) = simulated(&RegisterId::ALL);
    component
        .uart_mut()
        .fail_always(RegisterId::Power, SimulatorFault::Silent);

    let start = Instant::now();
    let (report, finished) = poll_once(&mut component, start);

    assert_eq!(report.decoded.len(), 6);
    assert_eq!(report.stale.len(), 1);
    assert!(matches!(
        report.stale[0],
        (RegisterId::Power, KmpError::Timeout { register: RegisterId::Power, .. })
    ));
    // three attempts each waited out a full deadline
    assert!(finished - start >= Duration::from_millis(600));

    // every other sensor published exactly once, power never
    let published = published.borrow();
    assert_eq!(published.len(), 6);
    assert!(published.iter().all(|(r, _)| *r != RegisterId::Power));
    assert_eq!(component.publish_count(), 1);
    assert_eq!(component.stats().timeouts, 3);
}

#[test]
fn stale_register_keeps_and_republishes_previous_value() {
    let (mut component, published) = simulated(&[RegisterId::TempIn, RegisterId::Volume]);
    let start = Instant::now();
    poll_once(&mut component, start);
    let before = component.get(RegisterId::TempIn).unwrap();

    component
        .uart_mut()
        .fail_always(RegisterId::TempIn, SimulatorFault::Truncated);
    let (report, _) = poll_once(&mut component, start + Duration::from_secs(60));

    assert!(report.is_stale(RegisterId::TempIn));
    // idempotent reads of the cached value
    assert_eq!(component.get(RegisterId::TempIn), Some(before));
    assert_eq!(component.get(RegisterId::TempIn), Some(before));
    assert_eq!(
        *published.borrow(),
        vec![
            (RegisterId::TempIn, 72.35),
            (RegisterId::Volume, 4521.07),
            (RegisterId::TempIn, 72.35),
            (RegisterId::Volume, 4521.07),
        ]
    );
    assert_eq!(component.stats().framing_errors + component.stats().timeouts, 3);
}

#[test]
fn never_decoded_register_is_absent_and_not_published() {
    let uart = ScriptedUart::new([Reply::Silence, Reply::Silence, Reply::Silence]);
    let published = Published::default();
    let mut component =
        Multical402Component::new(uart, PollConfig::default(), Duration::from_secs(60));
    component.set_sensor(RegisterId::Volume, record(&published, RegisterId::Volume));

    let (report, _) = poll_once(&mut component, Instant::now());

    assert!(report.is_stale(RegisterId::Volume));
    assert_eq!(component.get(RegisterId::Volume), None);
    assert_eq!(component.get(RegisterId::Volume), None);
    assert!(published.borrow().is_empty());
    assert_eq!(component.publish_count(), 1);
}

#[test]
fn write_failures_are_retried_like_frame_errors() {
    let uart = ScriptedUart::new([Reply::WriteError, Reply::Bytes(energy_frame())]);
    let mut component =
        Multical402Component::new(uart, PollConfig::default(), Duration::from_secs(60));
    component.set_sensor(RegisterId::Energy, |_: f64| {});

    let (report, _) = poll_once(&mut component, Instant::now());
    assert_eq!(report.retries, 1);
    assert_eq!(component.stats().io_errors, 1);
    assert_eq!(component.get(RegisterId::Energy).unwrap().value, 123.456);
}

#[test]
fn mismatched_register_echo_is_malformed() {
    // a volume reply arriving for an energy request
    let volume = DecodedValue::new(RegisterId::Volume, 100, 0, Unit::CubicMetre);
    let wrong = encode_register_response(Destination::HeatMeter, &volume).unwrap();
    let uart = ScriptedUart::new([
        Reply::Bytes(wrong.clone()),
        Reply::Bytes(wrong),
        Reply::Bytes(energy_frame()),
    ]);
    let mut component =
        Multical402Component::new(uart, PollConfig::default(), Duration::from_secs(60));
    component.set_sensor(RegisterId::Energy, |_: f64| {});

    let (report, _) = poll_once(&mut component, Instant::now());
    assert_eq!(report.retries, 2);
    assert_eq!(component.stats().malformed_payloads, 2);
    assert!(report.value(RegisterId::Energy).is_some());
}

#[test]
fn steps_report_progress_in_order() {
    let (mut component, _) = simulated(&[RegisterId::Energy]);
    let now = Instant::now();
    component.on_poll_tick(now);

    // the component drives the sequencer until it completes or must wait
    let report = component.step(now).unwrap();
    assert_eq!(report.decoded.len(), 1);
    assert!(component.step(now).is_none());
    assert!(!component.is_polling());
    assert_eq!(component.last_report(), Some(&report));
    assert!(StepOutcome::Sent(RegisterId::Energy).has_more_work());
}

#[test]
fn overrun_tick_is_ignored_and_counted() {
    let (mut component, published) = simulated(&[RegisterId::Power]);
    component
        .uart_mut()
        .script(RegisterId::Power, [SimulatorFault::Silent]);

    let now = Instant::now();
    assert!(component.on_poll_tick(now));
    assert!(component.step(now).is_none());
    assert!(component.is_polling());

    assert!(!component.on_poll_tick(now + Duration::from_millis(50)));
    assert_eq!(component.overruns(), 1);

    // deadline passes, the retry is answered straight away
    let report = component.step(now + Duration::from_millis(250)).unwrap();
    assert_eq!(report.retries, 1);
    assert_eq!(published.borrow().len(), 1);
    assert!(component.on_poll_tick(now + Duration::from_secs(60)));
}

#[test]
fn decode_recovers_every_encoded_reading() {
    let decoder = RegisterDecoder::default();
    for request in REGISTERS.iter() {
        for unit in request.allowed_units {
            for (raw, exponent) in [
                (0i64, 0i8),
                (1, -3),
                (-4250, -2),
                (4_294_967_295, -1),
                (7, 3),
            ] {
                let reading = DecodedValue::new(request.id, raw, exponent, *unit);
                let payload = decoder.encode(&reading).unwrap();
                let decoded = decoder.decode(request.id, &payload).unwrap();
                assert!(
                    (decoded.value - reading.value).abs() <= reading.value.abs() * 1e-12,
                    "{} {:?}",
                    request.id,
                    reading
                );
                assert!(decoded.has_expected_unit());
            }
        }
    }
}
