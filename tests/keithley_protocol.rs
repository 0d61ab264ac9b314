//! Keithley 2400 command sequences observed on a mock link.

use mppt_daq::adapters::mock::LinkCall;
use mppt_daq::adapters::{InstrumentLink, MockLink};
use mppt_daq::error::MppError;
use mppt_daq::safety::{Channel, OutputCommand, ProtectionLimits, SweepDirection};
use mppt_daq::measurement::Sample;
use mppt_daq::sourcemeter::keithley2400::READ_MARGIN;
use mppt_daq::sourcemeter::{Keithley2400, Sourcemeter, SweepTiming};
use std::time::Duration;

fn limits() -> ProtectionLimits {
    ProtectionLimits::new(6.0, 0.288, 3.6, 0.058)
}

async fn open_keithley(link: MockLink) -> Keithley2400<MockLink> {
    let mut keithley = Keithley2400::new(link, limits(), SweepTiming::default());
    keithley.open().await.unwrap();
    keithley
}

#[tokio::test]
async fn out_of_envelope_voltage_never_reaches_the_wire() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    let err = keithley
        .set_output(&OutputCommand::fixed(Channel::Voltage, 4.0))
        .await
        .unwrap_err();
    match err {
        MppError::OutputLimitExceeded {
            channel,
            value,
            limit,
        } => {
            assert_eq!(channel, Channel::Voltage);
            assert_eq!(value, 4.0);
            assert_eq!(limit, 3.6);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(spy.writes().is_empty());
}

#[tokio::test]
async fn fixed_voltage_programs_function_mode_and_level() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    keithley
        .set_output(&OutputCommand::fixed(Channel::Voltage, 2.0))
        .await
        .unwrap();

    let writes = spy.writes();
    assert_eq!(
        &writes[..3],
        &[":SOUR:FUNC VOLT", ":SOUR:VOLT:MODE FIX", ":SOUR:VOLT 2"]
    );
    assert_eq!(writes.last().map(String::as_str), Some(":OUTP ON"));
}

#[tokio::test]
async fn negative_current_is_rejected() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    let err = keithley
        .set_output(&OutputCommand::fixed(Channel::Current, -0.001))
        .await
        .unwrap_err();
    assert!(matches!(err, MppError::OutputLimitExceeded { .. }));
    assert!(spy.writes().is_empty());
}

#[tokio::test]
async fn open_circuit_voltage_reads_then_switches_off() {
    // Voltage first, as the 2400 sends it.
    let link = MockLink::new("GPIB0::20::INSTR")
        .with_response("+9.600000E-01,+4.000000E-06,+1.234500E+01");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    let voc = keithley
        .find_open_circuit_voltage(Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(voc, 0.96);

    let calls = spy.call_log();
    let read = calls
        .iter()
        .position(|c| *c == LinkCall::Query(":READ?".to_string()))
        .unwrap();
    let source_zero_current = calls
        .iter()
        .position(|c| *c == LinkCall::Write(":SOUR:CURR 0".to_string()))
        .unwrap();
    assert!(source_zero_current < read);
    assert_eq!(calls.last(), Some(&LinkCall::Write(":OUTP OFF".to_string())));
    assert_eq!(calls.len() - 1, read + 1);
}

#[tokio::test]
async fn output_is_switched_off_when_the_read_fails() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;
    spy.fail_on_command(":READ?");

    let err = keithley
        .find_open_circuit_voltage(Duration::ZERO)
        .await
        .unwrap_err();
    assert!(err.is_communication());
    assert_eq!(spy.writes().last().map(String::as_str), Some(":OUTP OFF"));
}

#[tokio::test]
async fn both_directions_sweep_forward_then_reverse() {
    let link = MockLink::new("GPIB0::20::INSTR")
        .with_response("0.0,0.02,0.1,0.5,0.01,0.2,1.0,0.0,0.3")
        .with_response("1.0,0.0,0.4,0.5,0.01,0.5,0.0,0.02,0.6");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    let result = keithley.jv_sweep(1.0, SweepDirection::Both).await.unwrap();
    assert_eq!(result.curves.len(), 2);
    assert_eq!(result.forward().unwrap().samples.len(), 3);
    assert_eq!(result.reverse().unwrap().samples[0].voltage, 1.0);

    let writes = spy.writes();
    let forward_start = writes.iter().position(|w| w == ":SOUR:VOLT:STAR 0").unwrap();
    let reverse_start = writes.iter().position(|w| w == ":SOUR:VOLT:STAR 1").unwrap();
    assert!(forward_start < reverse_start);
    assert_eq!(writes.last().map(String::as_str), Some(":OUTP OFF"));
}

#[tokio::test]
async fn readback_tuples_are_voltage_first_on_the_wire() {
    let link = MockLink::new("GPIB0::20::INSTR")
        .with_response("+5.000000E-01,-1.900000E-02,+3.000000E+00");
    let mut keithley = open_keithley(link).await;

    keithley
        .set_output(&OutputCommand::fixed(Channel::Voltage, 0.5))
        .await
        .unwrap();
    let sample = keithley.read_output().await.unwrap();
    assert_eq!(sample, Sample::new(-0.019, 0.5, 3.0));
}

#[tokio::test]
async fn sweep_read_waits_for_every_point() {
    let link = MockLink::new("GPIB0::20::INSTR")
        .with_timeout(Duration::from_secs(60))
        .with_fallback_response("0.0,0.02,0.1,3.6,0.0,0.2");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    keithley
        .set_output(&OutputCommand::fixed(Channel::Voltage, 0.5))
        .await
        .unwrap();
    keithley.read_samples().await.unwrap();
    // 3.6 V at 0.04 V/s with 50 ms per point: 1800 points, 90 s
    keithley.jv_sweep(3.6, SweepDirection::Forward).await.unwrap();
    keithley
        .set_output(&OutputCommand::fixed(Channel::Voltage, 0.5))
        .await
        .unwrap();
    keithley.read_samples().await.unwrap();

    let timeouts: Vec<Duration> = spy
        .query_timeouts()
        .into_iter()
        .map(|(_, timeout)| timeout)
        .collect();
    assert_eq!(
        timeouts,
        vec![
            Duration::from_secs(60),
            Duration::from_secs(90) + READ_MARGIN,
            Duration::from_secs(60),
        ]
    );
}

#[tokio::test]
async fn single_direction_programs_one_sweep() {
    let link = MockLink::new("GPIB0::20::INSTR").with_response("0.0,0.02,0.1,1.0,0.0,0.2");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    keithley.jv_sweep(1.0, SweepDirection::Forward).await.unwrap();

    let sweeps = spy
        .writes()
        .iter()
        .filter(|w| w.ends_with("MODE SWE"))
        .count();
    assert_eq!(sweeps, 1);
    assert_eq!(spy.queries(), vec![":READ?".to_string()]);
}

#[tokio::test]
async fn sweep_above_protection_is_refused_before_any_write() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    let err = keithley
        .jv_sweep(5.0, SweepDirection::Reverse)
        .await
        .unwrap_err();
    assert!(matches!(err, MppError::OutputLimitExceeded { .. }));
    // Only the trailing output-off is sent.
    assert_eq!(spy.writes(), vec![":OUTP OFF".to_string()]);
}

#[tokio::test]
async fn reset_applies_protection_and_ranges() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    keithley.reset().await.unwrap();
    keithley.configure_data_output().await.unwrap();
    keithley.configure_data_output().await.unwrap();

    let writes = spy.writes();
    assert_eq!(writes[0], "*RST");
    assert!(writes.contains(&":SENS:VOLT:PROT 3.6".to_string()));
    assert!(writes.contains(&":SENS:CURR:PROT 0.058".to_string()));
    assert_eq!(
        writes
            .iter()
            .filter(|w| *w == ":FORM:ELEM CURR,VOLT,TIME")
            .count(),
        2
    );
}

#[tokio::test]
async fn raising_protection_past_ceiling_applies_ceiling() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;

    let effective = keithley.set_voltage_protection(10.0).await.unwrap();
    assert_eq!(effective, 6.0);
    assert!(spy.writes().contains(&":SENS:VOLT:PROT 6".to_string()));

    // 5 V is now inside the envelope.
    keithley
        .set_output(&OutputCommand::fixed(Channel::Voltage, 5.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn closing_releases_the_link() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    let mut keithley = open_keithley(link).await;
    assert!(keithley.link().is_open());

    keithley.close().await.unwrap();
    assert!(!spy.is_connected());
}
