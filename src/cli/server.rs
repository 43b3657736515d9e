use crate::cli::session;
use crate::config::{LeafcareConfig, DEFAULT_SERVE_SOCKET};
use crate::coordinator::InteractionCoordinator;
use crate::error::{LeafcareError, Result};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest request accepted on one connection
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// How long a client may take to send its request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the serve command
pub fn run_serve(socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(|| PathBuf::from(DEFAULT_SERVE_SOCKET));
    let config = LeafcareConfig::load()?;
    let coordinator = Arc::new(InteractionCoordinator::from_config(&config)?);

    let listener = bind(&socket_path)?;
    info!("Listening on {}", socket_path.display());
    serve(listener, coordinator);
    Ok(())
}

/// Bind the socket, replacing a stale one left by a previous run.
/// Anything else at the path (a regular file, a live server) is an error.
fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Ok(metadata) = fs::symlink_metadata(socket_path) {
        if !metadata.file_type().is_socket() {
            return Err(LeafcareError::InvalidRequest(format!(
                "{} exists and is not a socket",
                socket_path.display()
            )));
        }
        if UnixStream::connect(socket_path).is_ok() {
            return Err(LeafcareError::InvalidRequest(format!(
                "A server is already listening on {}",
                socket_path.display()
            )));
        }
        debug!("Removing stale socket {}", socket_path.display());
        fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(socket_path)?)
}

/// Accept connections forever, one thread per client
fn serve(listener: UnixListener, coordinator: Arc<InteractionCoordinator>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &coordinator, REQUEST_TIMEOUT) {
                        warn!("Connection failed: {}", e);
                    }
                });
            }
            Err(e) => warn!("Accept failed: {}", e),
        }
    }
}

/// One request per connection: the client writes a JSON object, shuts down
/// its write half and reads back a single JSON response.
fn handle_connection(
    mut stream: UnixStream,
    coordinator: &InteractionCoordinator,
    timeout: Duration,
) -> Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    let mut request = String::new();
    (&mut stream).take(MAX_REQUEST_BYTES).read_to_string(&mut request)?;

    let response = session::handle_line(coordinator, request.trim());
    stream.write_all(response.to_string().as_bytes())?;
    stream.flush()?;
    Ok(())
}
