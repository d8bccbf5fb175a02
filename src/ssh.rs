//! Remote endpoint sessions: one SSH + SFTP session per host per transfer.
//!
//! Strategies only see the `RemoteEndpoint` trait, so tests can drive them
//! against in-memory fakes while production code runs over ssh2.

use ssh2::Session;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Result, TransferError};

/// Collected output of one remote command round-trip.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// One live session to a remote host.
///
/// Remote commands are synchronous round-trips and none is assumed
/// idempotent; callers must not blindly retry destructive commands.
pub trait RemoteEndpoint: Send {
    /// Logical endpoint name, for logging and error text.
    fn name(&self) -> &str;

    /// Run a command remotely and collect stdout/stderr/exit status.
    fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Open a byte source for a remote file.
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Open a byte sink for a remote file.
    fn open_write(&mut self, path: &str) -> Result<Box<dyn Write + Send>>;

    /// Tear down the session. Further calls fail with a state error.
    fn close(&mut self);
}

/// Opens endpoint sessions by logical name. The seam that lets the worker
/// run against fakes in tests.
pub trait EndpointFactory: Send + Sync {
    fn connect(&self, name: &str) -> Result<Box<dyn RemoteEndpoint>>;
}

/// ssh2-backed endpoint.
pub struct SshEndpoint {
    name: String,
    session: Option<Session>,
}

impl SshEndpoint {
    pub fn connect(name: &str, host: &str, port: u16, user: &str, identity: &Path) -> Result<Self> {
        let fail = |detail: String| TransferError::Connection {
            host: host.to_string(),
            detail,
        };

        info!(endpoint = name, host, user, "connecting");
        let tcp = TcpStream::connect((host, port)).map_err(|e| fail(e.to_string()))?;
        let mut session = Session::new().map_err(|e| fail(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| fail(format!("handshake: {e}")))?;
        session
            .userauth_pubkey_file(user, None, identity, None)
            .map_err(|e| fail(format!("auth: {e}")))?;
        if !session.authenticated() {
            return Err(fail("authentication rejected".into()));
        }
        debug!(endpoint = name, "session established");
        Ok(SshEndpoint {
            name: name.to_string(),
            session: Some(session),
        })
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| TransferError::State(self.name.clone()))
    }
}

impl RemoteEndpoint for SshEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let session = self.session()?;
        debug!(endpoint = %self.name, command, "exec");
        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;
        let exit_status = channel.exit_status()?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        let sftp = self.session()?.sftp()?;
        let file = sftp.open(Path::new(path))?;
        Ok(Box::new(file))
    }

    fn open_write(&mut self, path: &str) -> Result<Box<dyn Write + Send>> {
        let sftp = self.session()?.sftp()?;
        let file = sftp.create(Path::new(path))?;
        Ok(Box::new(file))
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "transfer finished", None);
            debug!(endpoint = %self.name, "session closed");
        }
    }
}

impl Drop for SshEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Production factory: resolves logical names through `ServerConfig`.
pub struct SshConnector {
    config: Arc<ServerConfig>,
}

impl SshConnector {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        SshConnector { config }
    }
}

impl EndpointFactory for SshConnector {
    fn connect(&self, name: &str) -> Result<Box<dyn RemoteEndpoint>> {
        let ep = self
            .config
            .endpoint(name)
            .ok_or_else(|| TransferError::Connection {
                host: name.to_string(),
                detail: "unknown endpoint name".into(),
            })?;
        let endpoint =
            SshEndpoint::connect(name, &ep.host, ep.port, &ep.user, &self.config.identity_file)?;
        Ok(Box::new(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_session_is_a_state_error() {
        let mut ep = SshEndpoint {
            name: "src".into(),
            session: None,
        };
        match ep.run("true") {
            Err(TransferError::State(name)) => assert_eq!(name, "src"),
            other => panic!("expected state error, got {:?}", other.map(|_| ())),
        }
    }
}
