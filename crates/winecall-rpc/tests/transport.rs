use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use winecall_abi::{Arch, Value};
use winecall_rpc::{
    FailureKind, Handler, InvokeCallback, RemoteFailure, Reply, Request, RpcClient, RpcError,
    RpcServer, ServerControl, ServerStatus,
};

struct EchoHandler {
    calls: AtomicUsize,
}

impl Handler for EchoHandler {
    fn handle(&self, request: Request, control: &ServerControl) -> Result<Reply, RemoteFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request {
            Request::GetStatus => Ok(Reply::Status(ServerStatus {
                state: "up".into(),
                protocol_version: winecall_rpc::PROTOCOL_VERSION,
                server_version: "test".into(),
                arch: Arch::Win64,
                pid: std::process::id(),
            })),
            Request::InvokeCallback(InvokeCallback { args, .. }) => {
                Ok(Reply::Returned(args.into_iter().next().unwrap_or(Value::Void)))
            }
            Request::Terminate => {
                control.shutdown();
                Ok(Reply::Ack)
            }
            other => Err(RemoteFailure::new(
                FailureKind::Protocol,
                format!("unsupported {}", other.name()),
            )),
        }
    }
}

fn start() -> (RpcServer, Arc<EchoHandler>, RpcClient) {
    let handler = Arc::new(EchoHandler {
        calls: AtomicUsize::new(0),
    });
    let server = RpcServer::bind("test", "127.0.0.1:0", handler.clone()).unwrap();
    let client = RpcClient::connect(
        &server.local_addr().to_string(),
        Duration::from_secs(5),
        Duration::from_millis(10),
    )
    .unwrap();
    (server, handler, client)
}

#[test]
fn test_status_round_trip() {
    let (_server, _handler, client) = start();
    match client.call(Request::GetStatus).unwrap() {
        Reply::Status(status) => {
            assert_eq!(status.state, "up");
            assert_eq!(status.arch, Arch::Win64);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn test_remote_failure_is_not_transport() {
    let (_server, _handler, client) = start();
    let err = client
        .call(Request::DeliverLogLine(winecall_rpc::LogLine {
            session_id: "s1".into(),
            stream_name: "out".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            level: "info".into(),
            target: "t".into(),
            message: "m".into(),
        }))
        .unwrap_err();
    assert!(!err.is_transport());
    match err {
        RpcError::Remote(failure) => assert_eq!(failure.kind, FailureKind::Protocol),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_sequential_calls_share_one_connection() {
    let (_server, handler, client) = start();
    for i in 0..25i32 {
        let reply = client
            .call(Request::InvokeCallback(InvokeCallback {
                token: winecall_abi::CallbackToken(1),
                args: vec![Value::from(i)],
            }))
            .unwrap();
        assert_eq!(reply, Reply::Returned(Value::from(i)));
    }
    assert_eq!(handler.calls.load(Ordering::SeqCst), 25);
}

#[test]
fn test_terminate_stops_server() {
    let (mut server, _handler, client) = start();
    assert_eq!(client.call(Request::Terminate).unwrap(), Reply::Ack);
    server.wait();
    let err = client.call(Request::GetStatus).unwrap_err();
    assert!(err.is_transport());
}

#[test]
fn test_connect_times_out() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let result = RpcClient::connect(
        &addr.to_string(),
        Duration::from_millis(100),
        Duration::from_millis(10),
    );
    assert!(matches!(result, Err(RpcError::Connection(_))));
}

#[test]
fn test_closed_client_fails() {
    let (_server, _handler, client) = start();
    client.close();
    assert!(client.call(Request::GetStatus).unwrap_err().is_transport());
}

/// Holds every request until told to answer.
struct GateHandler {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Handler for GateHandler {
    fn handle(&self, _request: Request, _control: &ServerControl) -> Result<Reply, RemoteFailure> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(Reply::Ack)
    }
}

#[test]
fn test_try_call_skips_a_busy_channel() {
    let (entered, entered_rx) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    let handler = Arc::new(GateHandler {
        entered: Mutex::new(entered),
        release: Mutex::new(release_rx),
    });
    let server = RpcServer::bind("gate", "127.0.0.1:0", handler).unwrap();
    let client = Arc::new(
        RpcClient::connect(
            &server.local_addr().to_string(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap(),
    );

    let busy = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.call(Request::GetStatus))
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(client.try_call(Request::Terminate).is_none());

    release.send(()).unwrap();
    assert_eq!(busy.join().unwrap().unwrap(), Reply::Ack);

    release.send(()).unwrap();
    assert_eq!(client.try_call(Request::GetStatus).unwrap().unwrap(), Reply::Ack);
}
