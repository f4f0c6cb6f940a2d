//! Where the foreign server runs.
//!
//! A [`ForeignHost`] brings up whatever the server needs and starts it with
//! the session's connection parameters. [`WineHost`] is the production
//! host; tests plug in hosts that run the server in-process.

use std::path::{Path, PathBuf};

use winecall_rpc::ConnectionInfo;

use crate::config::SessionConfig;
use crate::error::{Result, WinecallError};
use crate::process::ForeignProcess;
use crate::wine::WineEnvironment;

pub trait ForeignHost: Send {
    /// Starts the foreign server. The native listener on
    /// `connection.port_in` is already accepting.
    fn launch(&mut self, connection: &ConnectionInfo) -> Result<()>;

    /// Path under which the foreign process sees a native file.
    fn translate_path(&self, path: &Path) -> Result<String>;

    /// Native file a foreign path names; the inverse of `translate_path`.
    fn native_path(&self, foreign: &str) -> Result<PathBuf>;

    /// Stops everything `launch` started. Must tolerate being called after
    /// a failed or partial launch.
    fn shutdown(&mut self);
}

/// Runs the server under Wine: one wineserver for the prefix and the
/// server executable started through `wine`/`wine64`.
pub struct WineHost {
    config: SessionConfig,
    wine: WineEnvironment,
    wineserver: Option<ForeignProcess>,
    server: Option<ForeignProcess>,
}

impl WineHost {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            config: config.clone(),
            wine: WineEnvironment::new(config),
            wineserver: None,
            server: None,
        }
    }

    pub fn environment(&self) -> &WineEnvironment {
        &self.wine
    }

    fn start(&mut self, connection: &ConnectionInfo) -> Result<()> {
        let server_path = self.config.server_path();
        if !server_path.is_file() {
            return Err(WinecallError::Startup(format!(
                "server executable {} does not exist",
                server_path.display()
            )));
        }
        self.wine.ensure_prefix()?;

        let mut command = self.wine.command(&self.config.wineserver_command);
        command.args(["-f", "-p"]);
        let wineserver = ForeignProcess::spawn(command, "wineserver", &self.config.id)
            .map_err(|e| WinecallError::Startup(format!("cannot start wineserver: {e}")))?;
        log::info!("wineserver started with pid {}", wineserver.id());
        self.wineserver = Some(wineserver);
        self.wine
            .wait_for_wineserver(self.config.startup_timeout(), self.config.poll_interval())?;

        let mut command = self.wine.command(self.config.wine_command());
        command.arg(&server_path).args(connection.to_args());
        log::debug!("launching {:?}", command);
        let server = ForeignProcess::spawn(command, "winecall-server", &self.config.id)
            .map_err(|e| WinecallError::Startup(format!("cannot start server: {e}")))?;
        log::info!("winecall-server started with pid {}", server.id());
        self.server = Some(server);
        Ok(())
    }
}

impl ForeignHost for WineHost {
    fn launch(&mut self, connection: &ConnectionInfo) -> Result<()> {
        let result = self.start(connection);
        if result.is_err() {
            self.shutdown();
        }
        result
    }

    fn translate_path(&self, path: &Path) -> Result<String> {
        self.wine.translate_path(path)
    }

    fn native_path(&self, foreign: &str) -> Result<PathBuf> {
        self.wine.wine_to_unix(foreign)
    }

    fn shutdown(&mut self) {
        let timeout = self.config.reader_join_timeout();
        if let Some(server) = self.server.take() {
            server.stop(libc::SIGINT, timeout);
        }
        if let Some(wineserver) = self.wineserver.take() {
            // A persistent wineserver stops on SIGINT followed by SIGKILL.
            let _ = wineserver.signal_group(libc::SIGINT);
            wineserver.stop(libc::SIGKILL, timeout);
        }
    }
}
