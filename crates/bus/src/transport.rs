use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Address of a socket on either plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Endpoint {
    /// Unix domain socket under `/tmp/exgraf/`, for same-host workers.
    Ipc(String),

    /// TCP, for distributed deployment. The bulk plane always uses TCP.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `ipc:///tmp/exgraf/<name>.sock`, `ipc://<name>` or `tcp://host:port`.
    pub fn parse(endpoint: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidEndpoint(endpoint.to_string());
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            let name = Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(invalid)?;
            Ok(Self::ipc(name))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            let port = port.parse().map_err(|_| invalid())?;
            if host.is_empty() {
                return Err(invalid());
            }
            Ok(Self::tcp(host, port))
        } else {
            Err(invalid())
        }
    }

    /// ZeroMQ endpoint string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc:///tmp/exgraf/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// `host:port` for plain TCP sockets. `None` for IPC.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Self::Ipc(_) => None,
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
        }
    }

    /// For IPC endpoints, create the socket directory and remove a stale
    /// socket file left by a previous process. No-op for TCP.
    pub fn prepare_bind(&self) -> std::io::Result<()> {
        if let Self::Ipc(_) = self {
            let endpoint = self.endpoint();
            let path = endpoint.strip_prefix("ipc://").unwrap_or(&endpoint);
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path, "removed stale IPC socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
