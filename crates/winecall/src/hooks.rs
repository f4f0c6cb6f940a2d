//! Process-exit and signal hooks.
//!
//! Sessions started with `exit_hooks` are terminated when the process exits
//! normally or receives SIGINT or SIGTERM, so no server or wineserver is
//! left behind. The signal handler only writes the signal number to a pipe;
//! a watcher thread does the teardown and then re-raises the signal with
//! the default disposition.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::session::SessionInner;

static SESSIONS: Lazy<Mutex<Vec<Weak<SessionInner>>>> = Lazy::new(|| Mutex::new(Vec::new()));
static INSTALL: Once = Once::new();
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

const HANDLED_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

pub(crate) fn register(session: &Arc<SessionInner>) {
    INSTALL.call_once(install);
    let mut sessions = SESSIONS.lock();
    sessions.retain(|s| s.strong_count() > 0);
    sessions.push(Arc::downgrade(session));
}

/// Terminates every live session registered for exit hooks.
pub fn terminate_all() {
    let live: Vec<Arc<SessionInner>> = SESSIONS
        .lock()
        .drain(..)
        .filter_map(|s| s.upgrade())
        .collect();
    for session in live {
        session.terminate();
    }
}

extern "C" fn at_exit() {
    terminate_all();
}

extern "C" fn on_signal(signal: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = signal as u8;
        // SAFETY: write(2) is async-signal-safe; the buffer outlives the call.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn install() {
    // SAFETY: at_exit is a plain extern "C" fn with no arguments.
    if unsafe { libc::atexit(at_exit) } != 0 {
        log::warn!("cannot register the exit hook");
    }

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        log::warn!(
            "cannot create the signal pipe: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    for fd in fds {
        // SAFETY: fd was just returned by pipe(2).
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    let [read_fd, write_fd] = fds;

    let watcher = thread::Builder::new()
        .name("winecall-signals".to_string())
        .spawn(move || watch(read_fd));
    if let Err(e) = watcher {
        log::warn!("cannot start the signal watcher: {e}");
        return;
    }
    WAKE_FD.store(write_fd, Ordering::SeqCst);

    for signal in HANDLED_SIGNALS {
        // SAFETY: the action is fully initialized and on_signal only calls
        // async-signal-safe functions.
        let installed = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if installed != 0 {
            log::warn!("cannot install a handler for signal {signal}");
        }
    }
}

fn watch(read_fd: libc::c_int) {
    loop {
        let mut byte = 0u8;
        // SAFETY: reads one byte into a local buffer.
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            let signal = libc::c_int::from(byte);
            log::info!("received signal {signal}, terminating sessions");
            terminate_all();
            // SAFETY: restores the default action and re-delivers the signal
            // to the process.
            unsafe {
                libc::signal(signal, libc::SIG_DFL);
                libc::raise(signal);
            }
            return;
        }
        if n < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        log::debug!("signal pipe closed, watcher exiting");
        return;
    }
}
