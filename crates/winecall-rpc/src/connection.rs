//! Session connection parameters
//!
//! Both channels of a session are loopback TCP sockets. The native side
//! listens on `port_in` for callbacks and log lines; the foreign server
//! listens on `port_out` for routine requests.

use std::net::TcpListener;

use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Connection information handed to the foreign server on its command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Session identifier, also used to tag forwarded output
    pub session_id: String,
    /// Address both sides bind to (usually 127.0.0.1)
    pub ip: String,
    /// Native listener (foreign to native channel)
    pub port_in: u16,
    /// Foreign listener (native to foreign channel)
    pub port_out: u16,
    /// Log level the foreign server should run with
    pub log_level: String,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            ip: "127.0.0.1".to_string(),
            port_in: 0,  // Let OS assign
            port_out: 0, // Let OS assign
            log_level: "info".to_string(),
        }
    }
}

impl ConnectionInfo {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn inbound_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port_in)
    }

    pub fn outbound_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port_out)
    }

    /// Validate that all required fields are present and valid
    pub fn validate(&self) -> Result<()> {
        if self.session_id.is_empty() {
            return Err(RpcError::Connection("session id cannot be empty".to_string()));
        }
        if self.ip.is_empty() {
            return Err(RpcError::Connection("IP address cannot be empty".to_string()));
        }
        for (name, port) in [("in", self.port_in), ("out", self.port_out)] {
            if port == 0 {
                return Err(RpcError::Connection(format!("{name} port must be assigned")));
            }
        }
        if self.port_in == self.port_out {
            return Err(RpcError::Connection(
                "in and out ports must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Assign free ports to every port still set to zero
    pub fn assign_ports(&mut self) -> Result<()> {
        fn find_available_port(ip: &str) -> Result<u16> {
            let listener = TcpListener::bind((ip, 0))
                .map_err(|e| RpcError::Connection(format!("failed to find available port: {e}")))?;
            Ok(listener
                .local_addr()
                .map_err(|e| RpcError::Connection(format!("failed to get port: {e}")))?
                .port())
        }

        if self.port_in == 0 {
            self.port_in = find_available_port(&self.ip)?;
        }
        while self.port_out == 0 || self.port_out == self.port_in {
            self.port_out = find_available_port(&self.ip)?;
        }
        Ok(())
    }

    /// Command-line arguments understood by the foreign server
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--id".to_string(),
            self.session_id.clone(),
            "--host".to_string(),
            self.ip.clone(),
            "--port-in".to_string(),
            self.port_in.to_string(),
            "--port-out".to_string(),
            self.port_out.to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ]
    }
}
