//! Ships the server's own log records to the native side.
//!
//! Records are queued by the process-wide log hook and delivered by a
//! dedicated thread once the inbound channel is up. When the queue is full
//! new records are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use winecall_logging::{set_log_hook, LogRecord};
use winecall_rpc::{LogLine, Request, RpcClient};

const QUEUE_CAPACITY: usize = 1024;
const POLL: Duration = Duration::from_millis(100);

/// Installs the log hook and returns the queue it feeds. Every line is
/// stamped with `session_id`.
pub fn install_log_hook(session_id: &str) -> Receiver<LogLine> {
    let (sender, receiver) = mpsc::sync_channel(QUEUE_CAPACITY);
    let session_id = session_id.to_string();
    set_log_hook(move |record: &LogRecord| enqueue(&sender, &session_id, record));
    receiver
}

fn enqueue(sender: &SyncSender<LogLine>, session_id: &str, record: &LogRecord) {
    // Transport logging would feed itself.
    if record.target.starts_with("winecall_rpc") {
        return;
    }
    let line = LogLine {
        session_id: session_id.to_string(),
        stream_name: LogLine::stream_for(&record.level).to_string(),
        timestamp: record.ts.clone(),
        level: record.level.clone(),
        target: record.target.clone(),
        message: record.message.clone(),
    };
    let _ = sender.try_send(line);
}

pub struct LogForwarder {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LogForwarder {
    pub fn spawn(lines: Receiver<LogLine>, client: Arc<RpcClient>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let task = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("winecall-log-forward".to_string())
                .spawn(move || pump(lines, client, stop))?
        };
        Ok(Self {
            stop,
            task: Some(task),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

impl Drop for LogForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump(lines: Receiver<LogLine>, client: Arc<RpcClient>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let line = match lines.recv_timeout(POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(err) = client.call(Request::DeliverLogLine(line)) {
            if err.is_transport() {
                // The native side is gone; nothing left to deliver to.
                break;
            }
        }
    }
}
