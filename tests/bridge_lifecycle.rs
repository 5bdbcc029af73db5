#![cfg(unix)]

use std::time::Duration;

use aethersense_bridge_lib::{
    bridge::{BridgeEvent, BridgeSubscription, LifecycleState, ProcessController, StopOutcome},
    config::BridgeConfig,
    telemetry::{LogLine, LogSource, TelemetryRecord},
    BridgeError,
};
use tokio::time::{timeout, Instant};

const SAMPLE: &str = r#"{"timestamp_ns":1,"energy_motion":0.5,"present":true,"fps":60,"p50_us":100,"p95_us":200,"drops":0,"corrupt":0}"#;

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> BridgeConfig {
    BridgeConfig {
        stop_grace: Duration::from_millis(300),
        drain_timeout: Duration::from_millis(500),
        ..BridgeConfig::default()
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

async fn wait_for_idle(controller: &ProcessController) {
    let mut rx = controller.subscribe_state();
    timeout(WAIT, rx.wait_for(|state| state.is_idle()))
        .await
        .expect("bridge did not return to idle")
        .expect("state channel closed");
}

fn drain(sub: &mut BridgeSubscription) -> (Vec<TelemetryRecord>, Vec<LogLine>) {
    let mut records = Vec::new();
    let mut logs = Vec::new();
    while let Some(event) = sub.try_recv() {
        match event {
            BridgeEvent::Record(record) => records.push(record),
            BridgeEvent::Log(line) => logs.push(line),
            BridgeEvent::Lagged(n) => panic!("test subscriber lagged by {n}"),
        }
    }
    (records, logs)
}

fn logs_from(logs: &[LogLine], source: LogSource) -> Vec<&LogLine> {
    logs.iter().filter(|line| line.source == source).collect()
}

/// First stdout line, parsed as the pid the script echoed.
async fn echoed_pid(sub: &mut BridgeSubscription) -> i32 {
    loop {
        let event = timeout(WAIT, sub.recv())
            .await
            .expect("engine printed nothing")
            .expect("event bus closed");
        if let BridgeEvent::Log(line) = event {
            if line.source == LogSource::Stdout {
                return line.text.trim().parse().expect("engine printed a pid");
            }
        }
    }
}

fn process_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } != 0 {
        return std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
    }
    // Orphans are reaped by init; until then a dead one still answers kill(pid, 0).
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

async fn assert_gone(pid: i32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(pid) {
        assert!(Instant::now() < deadline, "background child {pid} outlived the session");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn sample_line_becomes_one_record() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();

    controller
        .start("/bin/sh", &sh(&format!("printf '%s\\n' '{SAMPLE}'")))
        .await
        .unwrap();
    wait_for_idle(&controller).await;

    let (records, logs) = drain(&mut sub);
    assert_eq!(records.len(), 1);
    let record = records[0];
    assert_eq!(record.timestamp_ns, 1);
    assert_eq!(record.energy_motion, 0.5);
    assert!(record.present);
    assert_eq!(record.fps, 60.0);
    assert_eq!(record.p50_us, 100.0);
    assert_eq!(record.p95_us, 200.0);
    assert_eq!(record.drops, 0);
    assert_eq!(record.corrupt, 0);
    assert!(logs_from(&logs, LogSource::Stdout).is_empty());
}

#[tokio::test]
async fn garbage_line_becomes_one_log() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();

    controller.start("/bin/sh", &sh("echo garbage")).await.unwrap();
    wait_for_idle(&controller).await;

    let (records, logs) = drain(&mut sub);
    assert!(records.is_empty());
    let stdout = logs_from(&logs, LogSource::Stdout);
    assert_eq!(stdout.len(), 1);
    assert_eq!(stdout[0].text, "garbage");
}

#[tokio::test]
async fn invariant_violation_is_demoted_to_log() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();
    let bad = SAMPLE.replace(r#""drops":0"#, r#""drops":-1"#);

    controller
        .start("/bin/sh", &sh(&format!("printf '%s\\n' '{bad}'")))
        .await
        .unwrap();
    wait_for_idle(&controller).await;

    let (records, logs) = drain(&mut sub);
    assert!(records.is_empty());
    assert_eq!(logs_from(&logs, LogSource::Stdout)[0].text, bad);
}

#[tokio::test]
async fn unexpected_exit_resets_to_idle_with_one_notice() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();

    controller
        .start("/bin/sh", &sh("echo warming up; exit 3"))
        .await
        .unwrap();
    wait_for_idle(&controller).await;

    assert_eq!(controller.state(), LifecycleState::Idle);
    assert!(controller.session().await.is_none());

    let (_, logs) = drain(&mut sub);
    let notices = logs_from(&logs, LogSource::Bridge);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].text.contains("exited"), "{}", notices[0].text);
    assert!(notices[0].text.contains('3'), "{}", notices[0].text);
}

#[tokio::test]
async fn second_start_is_rejected_and_first_session_survives() {
    let controller = ProcessController::new(test_config());
    let first = controller.start("/bin/sh", &sh("sleep 30")).await.unwrap();

    let err = controller
        .start("/bin/sh", &sh("echo never"))
        .await
        .unwrap_err();
    match err {
        BridgeError::AlreadyRunning { session_id } => assert_eq!(session_id, first.id),
        other => panic!("expected AlreadyRunning, got {other}"),
    }

    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(controller.session().await, Some(first));

    let outcome = timeout(WAIT, controller.stop()).await.unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped { forced: false, .. }));
    assert_eq!(controller.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn stop_when_idle_is_a_noop() {
    let controller = ProcessController::new(test_config());
    assert_eq!(controller.stop().await, StopOutcome::NotRunning);
    assert_eq!(controller.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn stop_is_idempotent_and_emits_no_exit_notice() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();
    controller
        .start("/bin/sh", &sh("while :; do echo tick; sleep 0.05; done"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(
        timeout(WAIT, controller.stop()).await.unwrap(),
        StopOutcome::Stopped { .. }
    ));
    assert_eq!(controller.stop().await, StopOutcome::NotRunning);

    let (_, logs) = drain(&mut sub);
    assert!(logs_from(&logs, LogSource::Stdout)
        .iter()
        .all(|line| line.text == "tick"));
    assert!(logs_from(&logs, LogSource::Bridge).is_empty());
}

#[tokio::test]
async fn stubborn_engine_is_killed_after_grace() {
    let controller = ProcessController::new(test_config());
    controller
        .start("/bin/sh", &sh("trap '' TERM; while :; do sleep 0.05; done"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = timeout(WAIT, controller.stop()).await.unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped { forced: true, .. }));
    assert_eq!(controller.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn overlapping_stop_waits_for_release() {
    let controller = ProcessController::new(test_config());
    controller
        .start("/bin/sh", &sh("trap '' TERM; while :; do sleep 0.05; done"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.stop().await }
    });
    let mut state = controller.subscribe_state();
    timeout(WAIT, state.wait_for(|current| *current == LifecycleState::Stopping))
        .await
        .unwrap()
        .unwrap();

    let second = timeout(WAIT, controller.stop()).await.unwrap();
    assert_eq!(second, StopOutcome::Joined);
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert!(controller.session().await.is_none());

    let first = timeout(WAIT, first).await.unwrap().unwrap();
    assert!(matches!(first, StopOutcome::Stopped { forced: true, .. }));
}

#[tokio::test]
async fn stop_leaves_no_background_children() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();
    controller
        .start("/bin/sh", &sh("sleep 30 & echo $!; wait"))
        .await
        .unwrap();

    let pid = echoed_pid(&mut sub).await;
    assert!(process_alive(pid));

    timeout(WAIT, controller.stop()).await.unwrap();
    assert_gone(pid).await;
}

#[tokio::test]
async fn unexpected_exit_leaves_no_background_children() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();
    controller
        .start("/bin/sh", &sh("sleep 30 & echo $!; sleep 0.2; exit 1"))
        .await
        .unwrap();

    let pid = echoed_pid(&mut sub).await;
    wait_for_idle(&controller).await;
    assert_gone(pid).await;
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let controller = ProcessController::new(test_config());
    let err = controller
        .start("/definitely/not/an/engine", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Spawn { .. }));
    assert_eq!(controller.state(), LifecycleState::Idle);

    controller.start("/bin/sh", &sh("exit 0")).await.unwrap();
    wait_for_idle(&controller).await;
}

#[tokio::test]
async fn stderr_is_forwarded_verbatim() {
    let controller = ProcessController::new(test_config());
    let mut sub = controller.subscribe();

    controller
        .start("/bin/sh", &sh(&format!("echo 'calibrating  ' >&2; printf '%s\\n' '{SAMPLE}' >&2")))
        .await
        .unwrap();
    wait_for_idle(&controller).await;

    let (records, logs) = drain(&mut sub);
    assert!(records.is_empty());
    let stderr: Vec<&str> = logs_from(&logs, LogSource::Stderr)
        .iter()
        .map(|line| line.text.as_str())
        .collect();
    assert_eq!(stderr, vec!["calibrating  ", SAMPLE]);
}

#[tokio::test]
async fn restart_after_exit_gets_new_session() {
    let controller = ProcessController::new(test_config());
    let first = controller.start("/bin/sh", &sh("exit 0")).await.unwrap();
    wait_for_idle(&controller).await;

    let second = controller.start("/bin/sh", &sh("sleep 30")).await.unwrap();
    assert_ne!(first.id, second.id);
    timeout(WAIT, controller.shutdown()).await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Idle);
}
