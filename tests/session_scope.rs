//! Resource scope: acquisition order, guaranteed release, failure paths.

use async_trait::async_trait;
use futures::FutureExt;
use mppt_daq::adapters::mock::LinkCall;
use mppt_daq::adapters::MockLink;
use mppt_daq::error::{AppResult, MppError};
use mppt_daq::safety::{Channel, OutputCommand, ProtectionLimits};
use mppt_daq::session::{MeasurementSession, SessionTask};
use mppt_daq::shutter::{LinkShutter, Shutter, DEFAULT_CLOSE_COMMAND};
use mppt_daq::sourcemeter::simulated::OperationLog;
use mppt_daq::sourcemeter::{
    Keithley2400, PvCellModel, SimOp, SimulatedSourcemeter, Sourcemeter, SweepTiming,
};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn simulator() -> SimulatedSourcemeter {
    SimulatedSourcemeter::new(
        PvCellModel::default(),
        ProtectionLimits::default(),
        SweepTiming::default(),
    )
}

/// Shutter that checks, at release time, whether the sourcemeter is already closed.
struct RecordingShutter {
    sourcemeter_log: OperationLog,
    acquired: bool,
    released_after_sourcemeter: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

impl RecordingShutter {
    fn new(sourcemeter_log: OperationLog) -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
        let after = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        let shutter = Self {
            sourcemeter_log,
            acquired: false,
            released_after_sourcemeter: after.clone(),
            released: released.clone(),
        };
        (shutter, after, released)
    }
}

#[async_trait]
impl Shutter for RecordingShutter {
    fn name(&self) -> String {
        "Recording shutter".to_string()
    }

    async fn acquire(&mut self) -> AppResult<()> {
        self.acquired = true;
        Ok(())
    }

    async fn release(&mut self) -> AppResult<()> {
        let closed = self.sourcemeter_log.entries().contains(&SimOp::Close);
        self.released_after_sourcemeter.store(closed, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
        self.acquired = false;
        Ok(())
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }
}

struct SetVoltage(f64);

#[async_trait]
impl SessionTask for SetVoltage {
    type Output = ();

    async fn execute(&mut self, sm: &mut dyn Sourcemeter) -> AppResult<()> {
        sm.set_output(&OutputCommand::fixed(Channel::Voltage, self.0))
            .await
    }
}

struct FailWith(fn() -> MppError);

#[async_trait]
impl SessionTask for FailWith {
    type Output = ();

    async fn execute(&mut self, sm: &mut dyn Sourcemeter) -> AppResult<()> {
        sm.set_output(&OutputCommand::fixed(Channel::Voltage, 0.3))
            .await?;
        Err((self.0)())
    }
}

struct Panics;

#[async_trait]
impl SessionTask for Panics {
    type Output = ();

    async fn execute(&mut self, sm: &mut dyn Sourcemeter) -> AppResult<()> {
        sm.set_output(&OutputCommand::fixed(Channel::Voltage, 0.3))
            .await?;
        panic!("operator code blew up");
    }
}

fn assert_released(log: &OperationLog) {
    let ops = log.entries();
    let off = ops.iter().rposition(|op| *op == SimOp::OutputOff).unwrap();
    let close = ops.iter().rposition(|op| *op == SimOp::Close).unwrap();
    assert!(off < close, "{ops:?}");
    assert_eq!(close, ops.len() - 1);
}

#[tokio::test]
async fn sourcemeter_is_released_before_shutter() {
    let sm = simulator();
    let log = sm.operation_log();
    let (shutter, after, released) = RecordingShutter::new(log.clone());

    MeasurementSession::new(Box::new(sm))
        .with_shutter(Box::new(shutter))
        .run(&mut SetVoltage(0.5))
        .await
        .unwrap();

    assert!(released.load(Ordering::SeqCst));
    assert!(after.load(Ordering::SeqCst));
    assert_released(&log);
}

#[tokio::test]
async fn every_error_kind_still_releases_everything() {
    let errors: [fn() -> MppError; 3] = [
        || MppError::CancellationRequested,
        || MppError::Communication(anyhow::anyhow!("GPIB timeout")),
        || MppError::Configuration("late".to_string()),
    ];

    for make in errors {
        let sm = simulator();
        let log = sm.operation_log();
        let (shutter, after, released) = RecordingShutter::new(log.clone());

        let result = MeasurementSession::new(Box::new(sm))
            .with_shutter(Box::new(shutter))
            .run(&mut FailWith(make))
            .await;

        assert!(result.is_err());
        assert_released(&log);
        assert!(released.load(Ordering::SeqCst));
        assert!(after.load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn panic_is_resumed_after_cleanup() {
    let sm = simulator();
    let log = sm.operation_log();
    let (shutter, _after, released) = RecordingShutter::new(log.clone());
    let session = MeasurementSession::new(Box::new(sm)).with_shutter(Box::new(shutter));

    let mut task = Panics;
    let outcome = AssertUnwindSafe(session.run(&mut task)).catch_unwind().await;

    assert!(outcome.is_err());
    assert_released(&log);
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn shutter_failure_releases_sourcemeter_and_skips_task() {
    let sm = simulator();
    let log = sm.operation_log();
    let shutter_link = MockLink::new("Dev1/port1/line0");
    shutter_link.inject_next_failure();

    let err = MeasurementSession::new(Box::new(sm))
        .with_shutter(Box::new(LinkShutter::new(shutter_link)))
        .run(&mut SetVoltage(0.5))
        .await
        .unwrap_err();

    assert!(err.is_communication());
    assert!(log.outputs().is_empty());
    assert_eq!(log.entries().last(), Some(&SimOp::Close));
}

#[tokio::test]
async fn failed_output_off_does_not_fail_the_session() {
    let link = MockLink::new("GPIB0::20::INSTR");
    let spy = link.clone();
    spy.fail_on_command(":OUTP OFF");
    let keithley = Keithley2400::new(link, ProtectionLimits::default(), SweepTiming::default());

    let shutter_link = MockLink::new("Dev1/port1/line0");
    let shutter_spy = shutter_link.clone();

    MeasurementSession::new(Box::new(keithley))
        .with_shutter(Box::new(LinkShutter::new(shutter_link)))
        .run(&mut SetVoltage(0.5))
        .await
        .unwrap();

    assert_eq!(spy.call_log().last(), Some(&LinkCall::Close));
    assert!(!spy.is_connected());
    assert_eq!(
        shutter_spy.writes().last().map(String::as_str),
        Some(DEFAULT_CLOSE_COMMAND)
    );
    assert!(!shutter_spy.is_connected());
}

#[tokio::test]
async fn limit_violation_in_task_propagates_after_cleanup() {
    let sm = simulator();
    let log = sm.operation_log();

    let err = MeasurementSession::new(Box::new(sm))
        .run(&mut SetVoltage(10.0))
        .await
        .unwrap_err();

    assert!(matches!(err, MppError::OutputLimitExceeded { .. }));
    assert_released(&log);
}
