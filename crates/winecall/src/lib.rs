//! Call routines of Windows DLLs from native Linux code.
//!
//! A [`Session`] starts a companion server under Wine and talks to it over
//! two local TCP channels: routine requests go out on one, callback
//! invocations and the server's log records come back on the other.
//!
//! ```no_run
//! use winecall::{CallingConvention, ConfigLoader, ScalarKind, Session, TypeDescriptor, Value};
//!
//! # fn main() -> anyhow::Result<()> {
//! let session = Session::start(ConfigLoader::load()?)?;
//! let library = session.load_library("demo.dll", CallingConvention::Cdecl)?;
//! let add = library.routine("add_ints")?;
//! add.set_args(vec![
//!     TypeDescriptor::scalar(ScalarKind::I16),
//!     TypeDescriptor::scalar(ScalarKind::I16),
//! ])
//! .set_return(TypeDescriptor::scalar(ScalarKind::I16));
//! let sum = add.call(&mut [Value::from(3i16), Value::from(4i16)])?;
//! assert_eq!(sum, Value::from(7i16));
//! session.terminate();
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod config;
pub mod error;
mod hooks;
pub mod host;
mod inbound;
pub mod library;
pub mod marshal;
pub mod process;
pub mod routine;
pub mod session;
pub mod wine;

pub use callback::{CallbackFn, CallbackRegistry};
pub use config::{ConfigLoader, SessionConfig};
pub use error::{Result, WinecallError};
pub use hooks::terminate_all;
pub use host::{ForeignHost, WineHost};
pub use library::LibraryHandle;
pub use routine::Routine;
pub use session::{Session, SessionState};
pub use wine::WineEnvironment;

pub use winecall_abi::{
    Arch, CallbackSignature, CallbackToken, CallingConvention, LengthExpr, LengthSource,
    MemsyncRule, Pointer, RoutineSignature, Scalar, ScalarKind, StructDescriptor, StructField,
    TypeDescriptor, Value, ValuePath,
};
pub use winecall_rpc::{ConnectionInfo, ServerStatus};

/// Version of this crate; the server must report the same one.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
