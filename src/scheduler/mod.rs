//! The scheduler (master): admits queries from clients, dispatches them to
//! workers, preempts under PRIORITY, ages READY queries, and reconciles
//! state on worker/client disconnects. See `dispatch` for the algorithm,
//! `state` for the shared tables and lock discipline, `client_conn` and
//! `worker_conn` for the two connection roles sharing one listening port.

pub mod client_conn;
pub mod dispatch;
pub mod error;
pub mod state;
pub mod worker_conn;

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use log::{error, warn};

use crate::wire::OpCode;

pub use error::SchedulerError;
pub use state::{Policy, SchedulerState};

/// Binds `addr` and spawns one thread per accepted connection. Client and
/// worker connections share this single port; the first op code (peeked,
/// not consumed) decides which handler takes the socket.
pub fn serve(addr: &str, state: Arc<SchedulerState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    log::info!("scheduler: listening on {}", addr);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                std::thread::spawn(move || route_connection(stream, state));
            }
            Err(e) => error!("scheduler: accept failed: {}", e),
        }
    }
    Ok(())
}

fn route_connection(stream: TcpStream, state: Arc<SchedulerState>) {
    let mut peek_buf = [0u8; 4];
    let op = match stream.peek(&mut peek_buf) {
        Ok(4) => OpCode::from_u32(u32::from_be_bytes(peek_buf)).ok(),
        _ => None,
    };

    let result = match op {
        Some(OpCode::HandshakeClient) => client_conn::handle_connection(stream, state),
        Some(OpCode::HandshakeWorker) => worker_conn::handle_connection(stream, state),
        other => {
            warn!("scheduler: rejecting connection with unexpected handshake {:?}", other);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("scheduler: connection ended: {}", e);
    }
}
