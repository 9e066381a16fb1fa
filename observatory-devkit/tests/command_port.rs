//! The operator command port over a real TCP connection.

use observatory_devkit::observatory_test;
use observatory_devkit::test_utils::{wait_for, NIGHT_UNIX};
use observatory_kernel::master::ObservatoryState;
use observatory_kernel::models::{unix_to_mjd, Observation};
use observatory_kernel::schedule::write_schedule_db;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const LIMIT: Duration = Duration::from_secs(10);

struct Operator {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Operator {
    async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let (r, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self { lines: BufReader::new(r).lines(), writer })
    }

    async fn ask(&mut self, line: &str) -> anyhow::Result<String> {
        self.writer.write_all(format!("{line}\n").as_bytes()).await?;
        let reply = tokio::time::timeout(LIMIT, self.lines.next_line()).await??;
        reply.ok_or_else(|| anyhow::anyhow!("connection closed after {line:?}"))
    }
}

observatory_test!(operator_session, |h| {
    h.start().await?;
    h.wait_connected(LIMIT).await?;
    let addr = h.serve_commands().await?;
    let mut op = Operator::connect(addr).await?;

    let status = op.ask("status").await?;
    assert!(status.starts_with("OK {"), "{status}");
    assert!(status.contains("\"state\":\"IDLE\""), "{status}");

    // Errors keep the session open.
    assert!(op.ask("frobnicate").await?.starts_with("ERROR unknown command"));
    assert!(op.ask("trigger").await?.starts_with("ERROR usage"));
    assert!(op.ask("send mount 'oops").await?.starts_with("ERROR parse error"));
    assert_eq!(op.ask("trigger nighttime").await?, "OK ignored: not valid in IDLE (now IDLE)");

    // Device triggers only in engineering.
    assert!(op.ask("device camera startup").await?.starts_with("ERROR device triggers are only accepted"));
    assert_eq!(op.ask("trigger engineering").await?, "OK IDLE -> ENGINEERING (now ENGINEERING)");
    assert!(op.ask("device camera startup").await?.starts_with("OK Transitioned"));
    assert_eq!(op.ask("trigger exit_engineering").await?, "OK ENGINEERING -> IDLE (now IDLE)");

    let mount = h.device("mount")?;
    assert_eq!(op.ask("send mount goto_ra_dec 10.5 -20").await?, "OK \"ok\"");
    assert!(mount.calls().contains(&("goto_ra_dec".to_string(), vec![json!(10.5), json!(-20)])));
    assert!(op.ask("send dome open").await?.starts_with("ERROR unknown subsystem dome"));

    assert_eq!(op.ask("quit").await?, "OK bye");
    Ok(())
});

observatory_test!(schedules_managed_at_runtime, |h| {
    let now = unix_to_mjd(NIGHT_UNIX as f64);
    let too = h.path("grb.db");
    write_schedule_db(
        &too,
        &[Observation {
            id: 900,
            ra: 200.0,
            dec: -5.0,
            filter: "H".into(),
            exposure_time: 0.05,
            valid_start: now - 0.01,
            valid_stop: now + 0.01,
            priority: 0.0,
            observed: false,
            dither_number: 1,
        }],
    )?;
    h.config.scheduler.start_running = false;
    h.start().await?;
    h.wait_connected(LIMIT).await?;
    let addr = h.serve_commands().await?;
    let mut op = Operator::connect(addr).await?;

    assert_eq!(op.ask(&format!("load_too grb {}", too.display())).await?, "OK grb loaded (1 observations)");
    assert!(op.ask("load_too nightly /nope.db").await?.starts_with("ERROR"));
    assert!(op.ask("load_nightly /definitely/missing.db").await?.starts_with("ERROR"));
    let listed = op.ask("schedules").await?;
    assert!(listed.contains("\"name\":\"grb\"") && listed.contains("\"current\":900"), "{listed}");

    assert_eq!(op.ask("safety ok").await?, "OK safety ok");
    op.ask("trigger begin_startup").await?;
    h.wait_for_state(ObservatoryState::Observing, LIMIT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.exposures.records().is_empty(), "executor must stay stopped");

    assert_eq!(op.ask("start_schedule").await?, "OK schedule executor running");
    let log = h.exposures.clone();
    wait_for("the ToO visit", LIMIT, || log.visits().len() == 1).await?;
    assert_eq!(log.visits()[0].schedule, "grb");
    // dither_number 1: a single exposure.
    assert_eq!(log.records().len(), 2);

    assert_eq!(op.ask("stop_schedule").await?, "OK schedule executor stopped");
    assert_eq!(op.ask("unload_too grb").await?, "OK grb unloaded");
    assert!(op.ask("unload_too grb").await?.starts_with("ERROR no schedule named grb"));
    Ok(())
});

observatory_test!(killserver_closes_the_listener, |h| {
    h.start().await?;
    let addr = h.serve_commands().await?;
    let mut first = Operator::connect(addr).await?;
    let mut second = Operator::connect(addr).await?;
    assert!(second.ask("help").await?.contains("load_too <name> <path>"));

    assert_eq!(first.ask("killserver").await?, "OK server shutting down");
    wait_for("listener closed", LIMIT, || std::net::TcpStream::connect(addr).is_err()).await?;
    // Other sessions are closed too.
    let next = tokio::time::timeout(LIMIT, second.lines.next_line()).await??;
    assert_eq!(next, None);
    Ok(())
});
