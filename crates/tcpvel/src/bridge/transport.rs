//! Socket transport for the producer channel.
//!
//! Platform-specific listeners:
//! - **Named**: filesystem socket (macOS, Linux, BSD)
//! - **Abstract**: Linux abstract namespace (no filesystem entry, auto-cleanup)
//!
//! The server binds once per pipeline start; every producer incarnation connects to the
//! same address, which it learns from the `TCPVEL_CHANNEL` environment variable.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};

/// Environment variable carrying the JSON-encoded `ChildChannelInfo`.
pub const CHANNEL_ENV_VAR: &str = "TCPVEL_CHANNEL";

/// Information passed to the producer process for connecting to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ChildChannelInfo {
    NamedSocket {
        path: PathBuf,
    },
    #[cfg(target_os = "linux")]
    AbstractSocket {
        name: String,
    },
}

impl ChildChannelInfo {
    pub fn to_env_value(&self) -> String {
        // Only strings and paths inside; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_env_value(value: &str) -> io::Result<Self> {
        serde_json::from_str(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// Read the channel address set by the parent.
pub fn channel_info_from_env() -> io::Result<ChildChannelInfo> {
    let value = std::env::var(CHANNEL_ENV_VAR).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{CHANNEL_ENV_VAR} is not set (not started by the server?)"),
        )
    })?;
    ChildChannelInfo::from_env_value(&value)
}

fn unique_name() -> String {
    format!(
        "tcpvel-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Named socket listener.
///
/// Socket path format: `{temp_dir}/tcpvel-{pid}-{uuid}.sock`
pub struct NamedSocketListener {
    path: PathBuf,
    listener: UnixListener,
}

impl NamedSocketListener {
    pub fn bind() -> io::Result<(Self, ChildChannelInfo)> {
        let path = std::env::temp_dir().join(format!("{}.sock", unique_name()));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(transport_type = "named", path = %path.display(), "Bound channel socket");

        let info = ChildChannelInfo::NamedSocket { path: path.clone() };
        Ok((Self { path, listener }, info))
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for NamedSocketListener {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove channel socket");
        }
    }
}

/// Abstract namespace listener (Linux only).
#[cfg(target_os = "linux")]
pub struct AbstractSocketListener {
    name: String,
    listener: UnixListener,
}

#[cfg(target_os = "linux")]
impl AbstractSocketListener {
    pub fn bind() -> io::Result<(Self, ChildChannelInfo)> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        let name = unique_name();
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;

        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(transport_type = "abstract", name = %name, "Bound channel socket");

        let info = ChildChannelInfo::AbstractSocket { name: name.clone() };
        Ok((Self { name, listener }, info))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

pub enum ChannelListener {
    Named(NamedSocketListener),
    #[cfg(target_os = "linux")]
    Abstract(AbstractSocketListener),
}

impl ChannelListener {
    pub async fn accept(&self) -> io::Result<UnixStream> {
        match self {
            Self::Named(l) => l.accept().await,
            #[cfg(target_os = "linux")]
            Self::Abstract(l) => l.accept().await,
        }
    }
}

/// Bind using the platform default (abstract on Linux, named elsewhere).
pub fn bind_listener() -> io::Result<(ChannelListener, ChildChannelInfo)> {
    #[cfg(target_os = "linux")]
    {
        let (listener, info) = AbstractSocketListener::bind()?;
        Ok((ChannelListener::Abstract(listener), info))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let (listener, info) = NamedSocketListener::bind()?;
        Ok((ChannelListener::Named(listener), info))
    }
}

/// Connect from the producer side.
pub async fn connect(info: &ChildChannelInfo) -> io::Result<UnixStream> {
    match info {
        ChildChannelInfo::NamedSocket { path } => UnixStream::connect(path).await,
        #[cfg(target_os = "linux")]
        ChildChannelInfo::AbstractSocket { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}
