use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
};

use cfg_if::cfg_if;

#[cfg(not(windows))]
const SOCKET_FILE: &str = "timekeep.sock";

/// Where the daemon of an application directory listens. A Unix socket inside the directory, or
/// a named pipe derived from it on Windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    pub fn for_dir(dir: &Path) -> Self {
        #[cfg(windows)]
        let path = {
            use std::hash::{DefaultHasher, Hash, Hasher};

            let mut hasher = DefaultHasher::new();
            dir.hash(&mut hasher);
            PathBuf::from(format!(r"\\.\pipe\timekeep-{:016x}", hasher.finish()))
        };
        #[cfg(not(windows))]
        let path = dir.join(SOCKET_FILE);
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

cfg_if! {
    if #[cfg(unix)] {
        use tokio::net::{UnixListener, UnixStream};
        use tracing::{debug, warn};

        pub type ServerStream = UnixStream;
        pub type ClientStream = UnixStream;

        pub struct Listener {
            inner: UnixListener,
            path: PathBuf,
        }

        impl Listener {
            /// Binds the socket, replacing a stale one. Callers hold the instance lock, so a socket
            /// that is still present belongs to a dead daemon.
            pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
                use std::os::unix::fs::PermissionsExt;

                match std::fs::remove_file(&endpoint.path) {
                    Ok(()) => debug!("Removed stale socket {endpoint}"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let inner = UnixListener::bind(&endpoint.path)?;
                std::fs::set_permissions(&endpoint.path, std::fs::Permissions::from_mode(0o600))?;
                Ok(Self {
                    inner,
                    path: endpoint.path.clone(),
                })
            }

            pub async fn accept(&mut self) -> io::Result<ServerStream> {
                let (stream, _) = self.inner.accept().await?;
                Ok(stream)
            }
        }

        impl Drop for Listener {
            fn drop(&mut self) {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Couldn't remove socket {:?} {e:?}", self.path);
                }
            }
        }

        pub async fn connect(endpoint: &Endpoint) -> io::Result<ClientStream> {
            UnixStream::connect(&endpoint.path).await
        }
    } else if #[cfg(windows)] {
        use std::time::Duration;

        use tokio::net::windows::named_pipe::{
            ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
        };

        pub type ServerStream = NamedPipeServer;
        pub type ClientStream = NamedPipeClient;

        const ERROR_PIPE_BUSY: i32 = 231;

        /// Named pipes serve one client per instance, so a fresh instance is created as soon as the
        /// pending one gets connected.
        pub struct Listener {
            name: PathBuf,
            pending: NamedPipeServer,
        }

        impl Listener {
            pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
                let pending = ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(&endpoint.path)?;
                Ok(Self {
                    name: endpoint.path.clone(),
                    pending,
                })
            }

            pub async fn accept(&mut self) -> io::Result<ServerStream> {
                self.pending.connect().await?;
                let next = ServerOptions::new().create(&self.name)?;
                Ok(std::mem::replace(&mut self.pending, next))
            }
        }

        pub async fn connect(endpoint: &Endpoint) -> io::Result<ClientStream> {
            loop {
                match ClientOptions::new().open(&endpoint.path) {
                    Ok(client) => return Ok(client),
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
