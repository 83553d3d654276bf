//! Activity-extended deadlines, measured on paused tokio time.

mod common;

use common::{in_command, SAMPLE};
use mi_core::ProtocolError;
use mi_protocol::Expect;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const TIMEOUT: Duration = Duration::from_millis(1000);

#[tokio::test(start_paused = true)]
async fn chatty_instrument_outlives_the_timeout() {
    let (protocol, mut harness, _sinks) = in_command().await;
    let engine = protocol.context().engine();
    let start = Instant::now();

    // four lines 800ms apart: 3.2s in total, never 1s of silence
    let instrument = async {
        harness.expect_write(b"DS\r\n").await;
        for line in ["SBE 43 V 1.0", "vbatt = 13.2", "samples = 42", "sample interval = 10"] {
            sleep(Duration::from_millis(800)).await;
            harness.send_response(format!("{line}\r\n").as_bytes()).unwrap();
        }
        sleep(Duration::from_millis(800)).await;
        harness.send_response(b"S>").unwrap();
    };
    let (lines, ()) = tokio::join!(engine.send_and_expect_prompt("DS", TIMEOUT), instrument);

    assert_eq!(lines.unwrap().len(), 4);
    assert!(start.elapsed() >= Duration::from_millis(4000));
}

#[tokio::test(start_paused = true)]
async fn samples_count_as_activity() {
    let (protocol, mut harness, mut sinks) = in_command().await;
    let engine = protocol.context().engine();

    let instrument = async {
        harness.expect_write(b"GetSD\r\n").await;
        for _ in 0..3 {
            sleep(Duration::from_millis(900)).await;
            harness.send_response(SAMPLE).unwrap();
        }
        sleep(Duration::from_millis(900)).await;
        harness.send_response(b"S>").unwrap();
    };
    let (lines, ()) = tokio::join!(engine.send_and_expect_prompt("GetSD", TIMEOUT), instrument);

    assert!(lines.unwrap().is_empty());
    assert_eq!(sinks.drain_frames().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn silence_times_out_after_the_window() {
    let (protocol, mut harness, _sinks) = in_command().await;
    let engine = protocol.context().engine();
    let start = Instant::now();

    let (result, ()) = tokio::join!(
        engine.send_and_expect_prompt("DS", TIMEOUT),
        harness.expect_write(b"DS\r\n"),
    );

    assert!(matches!(result.unwrap_err(), ProtocolError::Timeout { .. }));
    let elapsed = start.elapsed();
    assert!(elapsed >= TIMEOUT && elapsed < TIMEOUT + Duration::from_millis(10), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn timeout_after_partial_response_keeps_captured_lines() {
    let (protocol, mut harness, _sinks) = in_command().await;
    let engine = protocol.context().engine();
    let start = Instant::now();

    let instrument = async {
        harness.expect_write(b"DS\r\n").await;
        sleep(Duration::from_millis(600)).await;
        harness.send_response(b"SBE 43 V 1.0\r\nvbatt = ").unwrap();
    };
    let (result, ()) = tokio::join!(engine.send_and_expect_prompt("DS", TIMEOUT), instrument);

    // the deadline moved to 600ms + 1s when the partial response arrived
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1600), "{elapsed:?}");
    match result.unwrap_err() {
        ProtocolError::Timeout { lines, expected, .. } => {
            assert_eq!(expected, "any prompt");
            assert_eq!(lines, vec!["SBE 43 V 1.0", "vbatt = "]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn exact_prompt_is_required() {
    let (protocol, mut harness, _sinks) = in_command().await;
    let engine = protocol.context().engine();

    let instrument = async {
        harness.expect_write(b"DS\r\n").await;
        harness.send_response(b"S>").unwrap();
    };
    let expect = Expect::Prompt("S>".into());
    let (lines, ()) = tokio::join!(engine.send_and_expect("DS", &expect, TIMEOUT), instrument);
    assert!(lines.unwrap().is_empty());

    let wrong_prompt = Expect::Prompt("?>".into());
    let (result, ()) = tokio::join!(
        engine.send_and_expect("DS", &wrong_prompt, TIMEOUT),
        harness.expect_and_respond(b"DS\r\n", b"S>"),
    );
    assert!(matches!(result.unwrap_err(), ProtocolError::Timeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn pre_send_delay_is_honoured() {
    let mut config = common::config();
    config.timing.pre_send_delay_ms = 200;
    let (builder, _sinks) = common::builder(config);
    let (protocol, mut harness) = common::connect(builder).await;
    common::discover_idle(&protocol, &mut harness).await;
    let engine = protocol.context().engine();

    let start = Instant::now();
    let instrument = async {
        harness.expect_write(b"TS\r\n").await;
        let written = start.elapsed();
        harness.send_response(b"S>").unwrap();
        written
    };
    let (lines, written) = tokio::join!(engine.send_and_expect_prompt("TS", TIMEOUT), instrument);
    lines.unwrap();
    assert!(written >= Duration::from_millis(200), "{written:?}");
}
