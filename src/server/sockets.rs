//! Listening socket setup.

use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use log::{debug, info, warn};
use mio::net::{TcpListener, UnixListener};

/// Binds the local stream socket, creating the parent directory with mode
/// `0700` and clearing a stale socket left behind by a dead server.
pub fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
    }

    if path.exists() {
        // Probe the socket: refused means nobody is listening and the file
        // is stale.
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("server already running on {}", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!("removing stale socket {}", path.display());
                std::fs::remove_file(path)?;
            }
            Err(e) => {
                debug!("probing {} failed: {}", path.display(), e);
                std::fs::remove_file(path)?;
            }
        }
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    info!("listening on {}", path.display());

    Ok(listener)
}

/// Binds a TCP listener on the given address.
pub fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    info!("listening on {}", addr);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_socket_is_replaced() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("sonord-test-{}", std::process::id()));
        let path = dir.join("native");

        {
            let _first = bind_unix(&path)?;
        }

        // The listener is gone but the socket file remains; a second bind
        // must succeed by probing and unlinking it.
        assert!(path.exists());
        let _second = bind_unix(&path)?;

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
