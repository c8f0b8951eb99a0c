mod common;

use common::{harness, progress, sample, step, uv};
use rust_fplc::experiment::{EngineNotice, RunPhase, StopReason, Subsystem};
use rust_fplc::method::{EndAction, MethodSequence, MethodStep};
use rust_fplc::network::{Command, PumpId, TelemetryEvent, ValvePosition};
use rust_fplc::FplcError;
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<EngineNotice>) -> Vec<EngineNotice> {
    let mut notices = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        notices.push(notice);
    }
    notices
}

fn method(steps: Vec<MethodStep>) -> MethodSequence {
    MethodSequence::from_steps(steps).unwrap()
}

#[tokio::test]
async fn test_two_step_method_runs_to_end() {
    let mut h = harness();
    let mut notices = h.engine.subscribe_notices();

    h.engine
        .run_method(method(vec![
            step(1.0, EndAction::Continue),
            step(2.0, EndAction::Stop),
        ]))
        .await
        .unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Running);
    assert_eq!(h.sink.run_commands(), 1);

    h.engine.handle_telemetry(progress(0.5)).await.unwrap();
    assert_eq!(h.engine.state().step_progress, 50.0);

    h.engine.handle_telemetry(progress(1.0)).await.unwrap();
    assert_eq!(h.engine.state().current_step_index, 1);
    assert_eq!(h.sink.run_commands(), 2);

    h.engine.handle_telemetry(progress(2.0)).await.unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Idle);
    assert_eq!(h.sink.count("METHOD_STOP"), 1);

    let notices = drain(&mut notices);
    assert!(notices.contains(&EngineNotice::StepStarted { index: 1, total: 2 }));
    assert_eq!(
        notices.last(),
        Some(&EngineNotice::RunStopped(StopReason::EndAction))
    );
}

#[tokio::test]
async fn test_load_then_gradient_inject_scenario() {
    let mut h = harness();
    let load = MethodStep::isocratic(ValvePosition::Load, 1.0, 5.0).unwrap();
    let inject = MethodStep::isocratic(ValvePosition::Inject, 0.5, 2.0)
        .unwrap()
        .with_gradient(0.0, 50.0)
        .unwrap()
        .with_monitor(uv())
        .unwrap()
        .with_end_action(EndAction::Stop);
    h.engine.run_method(method(vec![load, inject])).await.unwrap();

    let first = h.sink.sent();
    let Some(Command::RunIsocratic(params)) = first.first() else {
        panic!("expected an isocratic run command, got {first:?}");
    };
    assert_eq!(params.valve, ValvePosition::Load);
    assert_eq!(params.flowrate, 1.0);
    assert_eq!(params.volume, 5.0);
    assert!(!h.engine.acquisition_active());

    h.engine.handle_telemetry(progress(5.0)).await.unwrap();
    let sent = h.sink.sent();
    let Some(Command::RunGradient(params)) = sent.last() else {
        panic!("expected a gradient run command, got {sent:?}");
    };
    assert_eq!(params.valve, ValvePosition::Inject);
    assert_eq!(params.min_percent, Some(0.0));
    assert_eq!(params.max_percent, Some(50.0));
    assert_eq!(params.start_adc, Some(true));
    assert!(h.engine.acquisition_active());
    assert_eq!(h.recorder.lock().unwrap().started, 1);

    h.engine.handle_sample(sample(0.0)).await.unwrap();
    h.engine.handle_sample(sample(1.0)).await.unwrap();
    assert_eq!(h.recorder.lock().unwrap().samples, 2);
    assert_eq!(h.engine.live_buffer().len(), 2);

    h.engine.handle_telemetry(progress(2.0)).await.unwrap();
    let sent = h.sink.sent();
    let stops: Vec<&Command> = sent
        .iter()
        .filter(|c| matches!(c, Command::MethodStop(_)))
        .collect();
    assert_eq!(stops.len(), 1);
    let Command::MethodStop(stop) = stops[0] else {
        unreachable!()
    };
    assert_eq!(stop.stop_adc, Some(true));
    assert_eq!(h.recorder.lock().unwrap().finalized, 1);
    assert_eq!(h.engine.state().phase, RunPhase::Idle);
    assert!(h.engine.live_buffer().is_empty());
}

#[tokio::test]
async fn test_continue_advances_once_per_step() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![
            step(1.0, EndAction::Continue),
            step(5.0, EndAction::Stop),
        ]))
        .await
        .unwrap();

    h.engine.handle_telemetry(progress(1.0)).await.unwrap();
    h.engine.handle_telemetry(progress(1.2)).await.unwrap();
    h.engine.handle_telemetry(progress(1.4)).await.unwrap();

    assert_eq!(h.engine.state().current_step_index, 1);
    assert_eq!(h.sink.run_commands(), 2);
    assert_eq!(h.engine.state().phase, RunPhase::Running);
}

#[tokio::test]
async fn test_last_step_continue_completes_run() {
    let mut h = harness();
    let mut notices = h.engine.subscribe_notices();
    h.engine
        .run_method(method(vec![step(1.0, EndAction::Continue)]))
        .await
        .unwrap();

    h.engine.handle_telemetry(progress(1.0)).await.unwrap();

    assert_eq!(h.engine.state().phase, RunPhase::Idle);
    assert_eq!(h.sink.count("METHOD_STOP"), 0);
    assert!(drain(&mut notices).contains(&EngineNotice::RunCompleted));
}

#[tokio::test]
async fn test_stop_on_final_step_saves_once() {
    let mut h = harness();
    let monitored = step(1.0, EndAction::Stop)
        .with_monitor(uv())
        .unwrap()
        .with_fraction_collection();
    h.engine.run_method(method(vec![monitored])).await.unwrap();
    assert!(h.engine.acquisition_active());
    assert_eq!(h.recorder.lock().unwrap().started, 1);

    h.engine.handle_sample(sample(0.0)).await.unwrap();
    h.engine.handle_telemetry(progress(1.0)).await.unwrap();

    let stops: Vec<Command> = h
        .sink
        .sent()
        .into_iter()
        .filter(|c| matches!(c, Command::MethodStop(_)))
        .collect();
    assert_eq!(stops.len(), 1);
    let Command::MethodStop(params) = &stops[0] else {
        unreachable!()
    };
    assert_eq!(params.stop_adc, Some(true));
    assert_eq!(params.stop_fraction, Some(true));

    assert_eq!(h.recorder.lock().unwrap().finalized, 1);
    assert!(!h.engine.acquisition_active());
    assert_eq!(h.engine.state().phase, RunPhase::Idle);
}

#[tokio::test]
async fn test_stop_twice_is_a_no_op() {
    let mut h = harness();
    let mut notices = h.engine.subscribe_notices();
    let monitored = step(10.0, EndAction::Continue).with_monitor(uv()).unwrap();
    h.engine.run_method(method(vec![monitored])).await.unwrap();
    h.engine.handle_sample(sample(0.0)).await.unwrap();

    h.engine.stop_method().await.unwrap();
    h.engine.stop_method().await.unwrap();

    assert_eq!(h.sink.count("METHOD_STOP"), 1);
    assert_eq!(h.recorder.lock().unwrap().finalized, 1);
    let saved = drain(&mut notices)
        .into_iter()
        .filter(|n| matches!(n, EngineNotice::RunSaved(_)))
        .count();
    assert_eq!(saved, 1);
}

#[tokio::test]
async fn test_run_without_samples_discards_its_log() {
    let mut h = harness();
    let mut notices = h.engine.subscribe_notices();
    let monitored = step(10.0, EndAction::Continue).with_monitor(uv()).unwrap();
    h.engine.run_method(method(vec![monitored])).await.unwrap();
    assert_eq!(h.recorder.lock().unwrap().started, 1);

    h.engine.stop_method().await.unwrap();

    let log = h.recorder.lock().unwrap();
    assert_eq!(log.discarded, 1);
    assert_eq!(log.finalized, 0);
    assert!(!drain(&mut notices)
        .iter()
        .any(|n| matches!(n, EngineNotice::RunSaved(_))));
}

#[tokio::test]
async fn test_stop_when_idle_sends_nothing() {
    let mut h = harness();
    h.engine.stop_method().await.unwrap();
    assert!(h.sink.sent().is_empty());
    assert_eq!(h.recorder.lock().unwrap().finalized, 0);
}

#[tokio::test]
async fn test_valve_fault_forces_stop() {
    let mut h = harness();
    let mut notices = h.engine.subscribe_notices();
    h.engine
        .run_method(method(vec![step(5.0, EndAction::Continue)]))
        .await
        .unwrap();

    h.engine
        .handle_telemetry(TelemetryEvent::ValveFault)
        .await
        .unwrap();

    assert_eq!(h.engine.state().phase, RunPhase::Idle);
    assert_eq!(h.sink.count("METHOD_STOP"), 1);
    let notices = drain(&mut notices);
    assert!(notices.contains(&EngineNotice::ValveFault));
    assert!(notices.contains(&EngineNotice::RunStopped(StopReason::ValveFault)));
}

#[tokio::test]
async fn test_pump_fault_defers_completion_until_cleared() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![
            step(1.0, EndAction::Continue),
            step(1.0, EndAction::Stop),
        ]))
        .await
        .unwrap();

    h.engine
        .handle_telemetry(TelemetryEvent::PumpError(PumpId::A))
        .await
        .unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Error);
    assert!(matches!(
        h.engine.acknowledge_faults(),
        Err(FplcError::DeviceFault(_))
    ));

    h.engine.handle_telemetry(progress(1.0)).await.unwrap();
    assert_eq!(h.engine.state().current_step_index, 0);
    assert_eq!(h.sink.run_commands(), 1);

    h.engine
        .handle_telemetry(TelemetryEvent::PumpErrorCleared(PumpId::A))
        .await
        .unwrap();
    assert!(h.engine.acknowledge_faults().is_ok());
    assert_eq!(h.engine.state().phase, RunPhase::Running);
    assert_eq!(h.engine.state().current_step_index, 1);
    assert_eq!(h.sink.run_commands(), 2);
}

#[tokio::test]
async fn test_fault_survives_stop_until_cleared() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![step(5.0, EndAction::Continue)]))
        .await
        .unwrap();
    h.engine
        .handle_telemetry(TelemetryEvent::PumpError(PumpId::A))
        .await
        .unwrap();

    h.engine.stop_method().await.unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Idle);
    assert!(matches!(
        h.engine.acknowledge_faults(),
        Err(FplcError::DeviceFault(_))
    ));

    let err = h
        .engine
        .run_method(method(vec![step(1.0, EndAction::Stop)]))
        .await
        .unwrap_err();
    assert!(matches!(err, FplcError::DeviceFault(_)));
    assert_eq!(h.engine.state().phase, RunPhase::Idle);

    h.engine
        .handle_telemetry(TelemetryEvent::PumpErrorCleared(PumpId::A))
        .await
        .unwrap();
    assert!(h.engine.acknowledge_faults().is_ok());
    h.engine
        .run_method(method(vec![step(1.0, EndAction::Stop)]))
        .await
        .unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Running);
}

#[tokio::test]
async fn test_error_overlay_waits_for_every_subsystem() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![step(5.0, EndAction::Continue)]))
        .await
        .unwrap();

    h.engine
        .handle_telemetry(TelemetryEvent::PumpError(PumpId::B))
        .await
        .unwrap();
    h.engine
        .handle_telemetry(TelemetryEvent::FractionCollectorError)
        .await
        .unwrap();
    h.engine
        .handle_telemetry(TelemetryEvent::PumpErrorCleared(PumpId::B))
        .await
        .unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Error);
    assert_eq!(
        h.engine.state().faults.uncleared(),
        vec![Subsystem::FractionCollector]
    );

    h.engine
        .handle_telemetry(TelemetryEvent::FractionCollectorErrorCleared)
        .await
        .unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Running);
}

#[tokio::test]
async fn test_resume_after_pause_end_action_runs_next_step() {
    let mut h = harness();
    let monitored = step(1.0, EndAction::Pause).with_monitor(uv()).unwrap();
    h.engine
        .run_method(method(vec![monitored, step(1.0, EndAction::Stop)]))
        .await
        .unwrap();

    h.engine.handle_telemetry(progress(1.0)).await.unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Paused);
    assert_eq!(h.sink.count("PAUSE_ADC"), 1);
    assert_eq!(h.sink.run_commands(), 1);

    h.engine.resume().await.unwrap();
    assert_eq!(h.sink.count("RESUME_ADC"), 1);
    assert_eq!(h.engine.state().phase, RunPhase::Running);
    assert_eq!(h.engine.state().current_step_index, 1);
    assert_eq!(h.sink.run_commands(), 2);
}

#[tokio::test]
async fn test_local_estimate_completes_past_margin() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![
            step(1.0, EndAction::Continue),
            step(5.0, EndAction::Stop),
        ]))
        .await
        .unwrap();

    // 1 ml/min: one second of samples delivers 1/60 ml.
    for t in 0..=61 {
        h.engine.handle_sample(sample(f64::from(t))).await.unwrap();
    }
    assert_eq!(h.engine.state().current_step_index, 0);

    h.engine.handle_sample(sample(70.0)).await.unwrap();
    assert_eq!(h.engine.state().current_step_index, 1);
    assert_eq!(h.sink.run_commands(), 2);
}

#[tokio::test]
async fn test_fault_period_does_not_count_toward_local_estimate() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![
            step(1.0, EndAction::Continue),
            step(5.0, EndAction::Stop),
        ]))
        .await
        .unwrap();

    for t in 0..=10 {
        h.engine.handle_sample(sample(f64::from(t))).await.unwrap();
    }
    h.engine
        .handle_telemetry(TelemetryEvent::PumpError(PumpId::A))
        .await
        .unwrap();
    for t in 11..=130 {
        h.engine.handle_sample(sample(f64::from(t))).await.unwrap();
    }
    h.engine
        .handle_telemetry(TelemetryEvent::PumpErrorCleared(PumpId::A))
        .await
        .unwrap();
    assert_eq!(h.engine.state().phase, RunPhase::Running);

    h.engine.handle_sample(sample(131.0)).await.unwrap();
    h.engine.handle_sample(sample(132.0)).await.unwrap();
    assert_eq!(h.engine.state().current_step_index, 0);
    assert_eq!(h.sink.run_commands(), 1);
}

#[tokio::test]
async fn test_disconnect_keeps_run_phase() {
    let mut h = harness();
    h.engine
        .run_method(method(vec![step(1.0, EndAction::Stop)]))
        .await
        .unwrap();

    h.sink.set_connected(false);
    h.engine
        .handle_telemetry(TelemetryEvent::Disconnected)
        .await
        .unwrap();

    assert_eq!(h.engine.state().phase, RunPhase::Running);
    assert_eq!(
        h.engine.state().connection_state,
        rust_fplc::network::ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_run_rejected_without_connection() {
    let mut h = harness();
    h.sink.set_connected(false);
    let err = h
        .engine
        .run_method(method(vec![step(1.0, EndAction::Stop)]))
        .await
        .unwrap_err();
    assert!(matches!(err, FplcError::NotConnected));
    assert_eq!(h.engine.state().phase, RunPhase::Idle);
}
