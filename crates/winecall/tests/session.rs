mod common;

use std::time::{Duration, Instant};

use common::{test_config, Fixture, HostStats, InProcessHost};
use winecall::{
    Arch, CallingConvention, ScalarKind, Session, SessionConfig, SessionState, TypeDescriptor,
    Value, WinecallError,
};

fn other_arch() -> Arch {
    match Arch::host() {
        Arch::Win64 => Arch::Win32,
        Arch::Win32 => Arch::Win64,
    }
}

#[test]
fn test_start_and_terminate() {
    let fixture = Fixture::start();
    let session = &fixture.session;
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(HostStats::get(&fixture.stats.launches), 1);

    let status = session.server_status().unwrap();
    assert_eq!(status.state, "up");
    assert_eq!(status.arch, Arch::host());
    assert_eq!(status.server_version, winecall::VERSION);

    session.terminate();
    assert_eq!(session.state(), SessionState::Terminated);
    session.terminate();
    assert_eq!(HostStats::get(&fixture.stats.shutdowns), 1);
}

#[test]
fn test_drop_terminates_once() {
    let fixture = Fixture::start();
    let stats = fixture.stats.clone();
    fixture.session.terminate();
    drop(fixture);
    assert_eq!(HostStats::get(&stats.shutdowns), 1);

    let fixture = Fixture::start();
    let stats = fixture.stats.clone();
    drop(fixture);
    assert_eq!(HostStats::get(&stats.shutdowns), 1);
}

#[test]
fn test_terminate_does_not_wait_for_a_call_in_flight() {
    let fixture = Fixture::start();
    let caller = fixture.call_with_sleeping_callback(Duration::from_secs(3));

    let started = Instant::now();
    fixture.session.terminate();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "terminate took {elapsed:?}");
    assert_eq!(fixture.session.state(), SessionState::Terminated);
    assert_eq!(HostStats::get(&fixture.stats.shutdowns), 1);

    let result = caller.join().unwrap();
    assert!(matches!(result, Err(WinecallError::Terminated(_))), "{result:?}");
    assert!(!fixture.session.is_lost());
}

#[test]
fn test_operations_after_terminate_fail() {
    let fixture = Fixture::start();
    let library = fixture.demo();
    let add = library.routine("add_ints").unwrap();
    fixture.session.terminate();

    let path = fixture.dll("other.dll");
    assert!(matches!(
        fixture.session.load_library(&path, CallingConvention::Cdecl),
        Err(WinecallError::Terminated(_))
    ));
    assert!(matches!(
        add.call(&mut [Value::from(1i16), Value::from(2i16)]),
        Err(WinecallError::Terminated(_))
    ));
    assert!(library.routine("increment").is_err());
}

#[test]
fn test_invalid_config_never_launches() {
    let (host, stats, _crash) = InProcessHost::new(Arch::host());
    let config = SessionConfig {
        log_level: "loud".to_string(),
        ..test_config()
    };
    let err = Session::start_with_host(config, Box::new(host)).unwrap_err();
    assert!(matches!(err, WinecallError::Config(_)));
    assert_eq!(HostStats::get(&stats.launches), 0);
}

#[test]
fn test_arch_mismatch_is_a_startup_error() {
    let (host, stats, _crash) = InProcessHost::new(other_arch());
    let err = Session::start_with_host(test_config(), Box::new(host)).unwrap_err();
    match err {
        WinecallError::Startup(message) => assert!(message.contains("runs as")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(HostStats::get(&stats.launches), 1);
    assert_eq!(HostStats::get(&stats.shutdowns), 1);
}

#[test]
fn test_server_version_must_match() {
    let (host, stats, _crash) = InProcessHost::new(Arch::host());
    let config = SessionConfig {
        server_version: "0.0.0-elsewhere".to_string(),
        ..test_config()
    };
    let err = Session::start_with_host(config, Box::new(host)).unwrap_err();
    assert!(matches!(err, WinecallError::Startup(message) if message.contains("0.0.0-elsewhere")));
    assert_eq!(HostStats::get(&stats.shutdowns), 1);
}

#[test]
fn test_load_library_is_idempotent() {
    let fixture = Fixture::start();
    let path = fixture.dll("demo.dll");
    let first = fixture
        .session
        .load_library(&path, CallingConvention::Cdecl)
        .unwrap();
    let second = fixture
        .session
        .load_library(&path, CallingConvention::Stdcall)
        .unwrap();
    assert_eq!(first.path(), second.path());
    assert_eq!(second.convention(), CallingConvention::Cdecl);
    assert_eq!(HostStats::get(&fixture.stats.opens), 1);

    let dotted = path.parent().unwrap().join(".").join("demo.dll");
    fixture
        .session
        .load_library(&dotted, CallingConvention::Cdecl)
        .unwrap();
    assert_eq!(HostStats::get(&fixture.stats.opens), 1);
}

#[test]
fn test_library_load_failures() {
    let fixture = Fixture::start();
    let missing = fixture.dir.path().join("absent.dll");
    assert!(matches!(
        fixture.session.load_library(&missing, CallingConvention::Cdecl),
        Err(WinecallError::LibraryLoad(_))
    ));

    let broken = fixture.dll("broken.dll");
    match fixture.session.load_library(&broken, CallingConvention::Cdecl) {
        Err(WinecallError::LibraryLoad(message)) => assert!(message.contains("not a valid image")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!fixture.session.is_lost());
}

#[test]
fn test_routine_resolution() {
    let fixture = Fixture::start();
    let library = fixture.demo();
    let first = library.routine("add_ints").unwrap();
    let again = library.routine("add_ints").unwrap();
    first.set_args(vec![
        TypeDescriptor::scalar(ScalarKind::I16),
        TypeDescriptor::scalar(ScalarKind::I16),
    ]);
    assert_eq!(again.signature().args.len(), 2);

    assert!(matches!(
        library.routine("does_not_exist"),
        Err(WinecallError::RoutineResolution(_))
    ));
}

#[test]
fn test_lost_session() {
    let fixture = Fixture::start();
    let library = fixture.demo();
    let add = library.routine("add_ints").unwrap();
    add.set_args(vec![
        TypeDescriptor::scalar(ScalarKind::I16),
        TypeDescriptor::scalar(ScalarKind::I16),
    ])
    .set_return(TypeDescriptor::scalar(ScalarKind::I16));
    assert_eq!(
        add.call(&mut [Value::from(1i16), Value::from(1i16)]).unwrap(),
        Value::from(2i16)
    );

    fixture.crash.now();
    let err = add
        .call(&mut [Value::from(1i16), Value::from(1i16)])
        .unwrap_err();
    assert!(err.is_session_lost(), "{err:?}");
    assert!(fixture.session.is_lost());
    assert!(add
        .call(&mut [Value::from(1i16), Value::from(1i16)])
        .unwrap_err()
        .is_session_lost());

    fixture.session.terminate();
    assert_eq!(fixture.session.state(), SessionState::Terminated);
    assert_eq!(HostStats::get(&fixture.stats.shutdowns), 1);
}

#[test]
fn test_translate_path_goes_through_the_host() {
    let fixture = Fixture::start();
    assert_eq!(
        fixture.session.translate_path("/opt/lib/demo.dll").unwrap(),
        "Z:\\opt\\lib\\demo.dll"
    );
    assert_eq!(
        fixture.session.native_path("Z:\\opt\\lib\\demo.dll").unwrap(),
        std::path::PathBuf::from("/opt/lib/demo.dll")
    );
    assert!(fixture.session.native_path("demo.dll").is_err());
}

#[test]
fn test_server_opens_foreign_path_and_keys_by_native_path() {
    let fixture = Fixture::start();
    let library = fixture.demo();
    let native = library.path().to_str().unwrap().to_string();
    assert_eq!(library.name(), "demo.dll");
    assert!(library.foreign_path().starts_with("Z:\\"));
    assert_ne!(library.foreign_path(), native);

    let opened = fixture.stats.opened.lock().clone();
    assert_eq!(opened, vec![library.foreign_path().to_string()]);
    assert_eq!(
        fixture.session.native_path(&opened[0]).unwrap(),
        library.path()
    );

    // Routines name the library by its native path on the wire.
    library.routine("add_ints").unwrap();
}
