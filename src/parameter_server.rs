//! Background parameter-server process.
//!
//! The serve loop has no natural exit: it accepts and holds connections from
//! masters and workers until the peer closes them. It stops only when the
//! supervising [`CancellationToken`] is cancelled or the whole process
//! terminates. The lifecycle controller's hard exit is the backstop for the
//! second case.

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Run the parameter server on `bind_addr` until `shutdown` is cancelled.
///
/// A bind failure ends the task without failing the job: the server is a
/// background auxiliary and the primary flow must keep going. On a real
/// cluster each node owns its own port, so a bind failure means the port is
/// taken by something outside this job.
pub async fn serve(bind_addr: String, task_index: usize, shutdown: CancellationToken) {
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %bind_addr, task_index, error = %e, "parameter server failed to bind");
            return;
        }
    };
    tracing::info!(addr = %bind_addr, task_index, "parameter server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(task_index, "parameter server shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, task_index, "parameter server accepted connection");
                    tokio::spawn(hold_connection(stream));
                }
                Err(e) => {
                    tracing::warn!(task_index, error = %e, "parameter server accept failed");
                }
            }
        }
    }
}

/// Keep a connection open until the peer closes it, discarding whatever the
/// engine sends. The sharded-state protocol itself belongs to the engine.
async fn hold_connection(mut stream: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
