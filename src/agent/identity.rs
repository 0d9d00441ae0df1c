//! Stable node identity and local address discovery
//!
//! The node id is a UUID persisted to a file in the agent's state
//! directory; an agent restarted with the file intact continues as the
//! same node.

use std::fs;
use std::io;
use std::net::UdpSocket;
use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

/// File holding the persisted node id.
pub const NODE_ID_FILE: &str = "node_id";

/// Load the node id from `dir`, generating and persisting a fresh one if
/// the file is missing or empty.
pub fn load_or_create_node_id(dir: &Path) -> io::Result<String> {
    let path = dir.join(NODE_ID_FILE);
    if path.exists() {
        let contents = fs::read_to_string(&path)?;
        let node_id = contents.trim();
        if !node_id.is_empty() {
            info!(%node_id, "loaded node id from {}", path.display());
            return Ok(node_id.to_string());
        }
        warn!("node id file {} is empty, regenerating", path.display());
    }

    let node_id = Uuid::new_v4().to_string();
    fs::write(&path, &node_id)?;
    info!(%node_id, "created node id at {}", path.display());
    Ok(node_id)
}

/// Best-effort local IP discovery: a connected UDP socket never sends a
/// packet but makes the OS pick the outbound interface. Falls back to
/// loopback.
pub fn local_ip() -> String {
    let discovered = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });
    match discovered {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            warn!(error = %e, "could not discover local ip, using loopback");
            "127.0.0.1".to_string()
        }
    }
}
