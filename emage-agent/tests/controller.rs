//! Agent against a mock controller on loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emage_agent::{ControllerConfig, Registry, ReportOutcome};
use emage_core::{
    AgentOps, LocalEvent, Message, OpsResult, Trigger, TriggerKind, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MockEnb {
    released: AtomicUsize,
    disconnects: AtomicUsize,
}

impl AgentOps for MockEnb {
    fn release(&self) -> Result<(), emage_core::OpsError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn enb_setup_request(&self) -> OpsResult {
        Ok(Some(b"mock-enb".to_vec()))
    }

    fn cell_setup_request(&self, cell_id: u16) -> OpsResult {
        Ok(Some(vec![cell_id as u8]))
    }
}

fn config(addr: String, report_buffer: usize) -> ControllerConfig {
    ControllerConfig {
        addr,
        reconnect_initial: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        report_buffer,
        ..ControllerConfig::default()
    }
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut len = [0u8; 4];
    timeout(STEP, stream.read_exact(&mut len))
        .await
        .expect("timed out waiting for a frame")
        .unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).await.unwrap();
    Message::from_bytes(&body).unwrap()
}

async fn write_message(stream: &mut TcpStream, msg: &Message) {
    let frame = emage_core::encode_message(msg).unwrap();
    stream.write_all(&frame).await.unwrap();
}

async fn accept_agent(listener: &TcpListener, enb_id: u64) -> TcpStream {
    let (mut stream, _) = timeout(STEP, listener.accept())
        .await
        .expect("agent never connected")
        .unwrap();
    assert_eq!(
        read_message(&mut stream).await,
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            enb_id
        }
    );
    stream
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(STEP, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn armed_trigger_reports_only_for_target_cell() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reg = Registry::new(config(listener.local_addr().unwrap().to_string(), 8));
    reg.start(Arc::new(MockEnb::default()), 1)
        .await
        .unwrap();
    let mut ctrl = accept_agent(&listener, 1).await;

    write_message(
        &mut ctrl,
        &Message::TriggerArm {
            seq: 1,
            trigger_id: 10,
            kind: TriggerKind::RrcMeas,
            target_cell: Some(3),
        },
    )
    .await;
    assert_eq!(read_message(&mut ctrl).await, Message::Ack { seq: 1 });
    assert!(reg.is_connected(1));
    assert!(reg.has_trigger(1, 10, TriggerKind::RrcMeas));

    let on_cell_3 = reg
        .report(1, 10, LocalEvent::new(TriggerKind::RrcMeas, Some(3)), || {
            b"meas".to_vec()
        })
        .await
        .unwrap();
    assert_eq!(on_cell_3, ReportOutcome::Sent);
    let on_cell_4 = reg
        .report(1, 10, LocalEvent::new(TriggerKind::RrcMeas, Some(4)), || {
            b"meas".to_vec()
        })
        .await
        .unwrap();
    assert_eq!(on_cell_4, ReportOutcome::Skipped);

    write_message(&mut ctrl, &Message::CellSetupRequest { seq: 2, cell_id: 5 }).await;
    // Exactly one report precedes the setup reply.
    assert_eq!(
        read_message(&mut ctrl).await,
        Message::Report {
            trigger_id: 10,
            kind: TriggerKind::RrcMeas,
            cell: Some(3),
            body: b"meas".to_vec()
        }
    );
    assert_eq!(
        read_message(&mut ctrl).await,
        Message::Reply {
            seq: 2,
            body: vec![5]
        }
    );

    reg.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outage_buffers_reports_and_flushes_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let enb = Arc::new(MockEnb::default());
    let reg = Registry::new(config(addr.to_string(), 5));
    reg.start(enb.clone(), 7).await.unwrap();
    let ctrl = accept_agent(&listener, 7).await;
    wait_until(|| reg.is_connected(7)).await;
    reg.arm_trigger(7, Trigger::new(10, TriggerKind::CellStats, None))
        .unwrap();

    drop(ctrl);
    drop(listener);
    wait_until(|| !reg.is_connected(7)).await;
    wait_until(|| enb.disconnects.load(Ordering::SeqCst) == 1).await;

    for i in 1..=6u8 {
        let outcome = reg
            .report(7, 10, LocalEvent::new(TriggerKind::CellStats, Some(0)), || {
                vec![i]
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Buffered);
    }

    let listener = TcpListener::bind(addr).await.unwrap();
    let mut ctrl = accept_agent(&listener, 7).await;
    for i in 2..=6u8 {
        assert_eq!(
            read_message(&mut ctrl).await,
            Message::Report {
                trigger_id: 10,
                kind: TriggerKind::CellStats,
                cell: Some(0),
                body: vec![i]
            }
        );
    }
    wait_until(|| reg.is_connected(7)).await;
    reg.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_closes_live_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let enb = Arc::new(MockEnb::default());
    let reg = Registry::new(config(listener.local_addr().unwrap().to_string(), 4));
    reg.start(enb.clone(), 2).await.unwrap();
    let mut ctrl = accept_agent(&listener, 2).await;
    reg.arm_trigger(2, Trigger::new(-1, TriggerKind::UesIdReport, None))
        .unwrap();

    timeout(STEP, reg.terminate(2))
        .await
        .expect("terminate blocked on the receive loop")
        .unwrap();
    assert_eq!(enb.released.load(Ordering::SeqCst), 1);
    assert!(!reg.has_trigger(2, -1, TriggerKind::UesIdReport));
    assert!(!reg.is_connected(2));
    // Session shutdown is not a controller loss.
    assert_eq!(enb.disconnects.load(Ordering::SeqCst), 0);

    let mut rest = Vec::new();
    let n = timeout(STEP, ctrl.read_to_end(&mut rest))
        .await
        .expect("agent kept the socket open")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_interrupts_report_to_stalled_controller() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let enb = Arc::new(MockEnb::default());
    let reg = Arc::new(Registry::new(config(
        listener.local_addr().unwrap().to_string(),
        4,
    )));
    reg.start(enb.clone(), 1).await.unwrap();
    // Accepts the hello, then never reads again.
    let _ctrl = accept_agent(&listener, 1).await;
    wait_until(|| reg.is_connected(1)).await;
    reg.arm_trigger(1, Trigger::new(10, TriggerKind::CellStats, None))
        .unwrap();

    let reporter = reg.clone();
    let pending = tokio::spawn(async move {
        reporter
            .report(1, 10, LocalEvent::new(TriggerKind::CellStats, None), || {
                vec![0u8; 32 << 20]
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pending.is_finished(), "report should be stuck on the socket");

    timeout(STEP, reg.terminate(1))
        .await
        .expect("terminate waited on a blocked write")
        .unwrap();
    assert_eq!(enb.released.load(Ordering::SeqCst), 1);
    assert_eq!(enb.disconnects.load(Ordering::SeqCst), 0);
    let outcome = timeout(STEP, pending)
        .await
        .expect("report never returned")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Buffered);
}
