//! Connection handling logic
//!
//! Runs the authenticated pipeline: decode the request header that follows
//! the credential line, then hand the connection to the TCP or UDP relay.

use tokio::io::BufReader;

use crate::core::{relay_tcp, RelayStats, Server, TrojanCmd, TrojanRequest};
use crate::error::Result;
use crate::logger::log;
use crate::transport::{ConnectionMeta, TransportStream};
use crate::udp::relay_udp;

/// Process an authenticated connection.
///
/// `conn` is positioned just past the credential line; whatever it has
/// buffered beyond the header is the start of the payload. The connection is
/// closed when this returns.
pub async fn process_trojan(
    server: &Server,
    mut conn: BufReader<TransportStream>,
    meta: ConnectionMeta,
) -> Result<RelayStats> {
    let request = match TrojanRequest::read_from(&mut conn).await {
        Ok(request) => request,
        Err(e) => {
            log::debug!(peer = %meta.peer_addr, error = %e, "Invalid request header");
            return Err(e.into());
        }
    };

    log::debug!(
        peer = %meta.peer_addr,
        cmd = %request.cmd,
        target = %request.addr,
        transport = %meta.transport_type,
        "Request decoded"
    );

    let result = match request.cmd {
        TrojanCmd::Connect => {
            relay_tcp(conn, &request.addr, server.conn_config.connect_timeout).await
        }
        TrojanCmd::UdpAssociate => relay_udp(conn, meta.peer_addr, &server.conn_config).await,
    };

    let stats = match &result {
        Ok(stats) => Some(*stats),
        Err(e) => e.relay_stats(),
    };
    if let Some(stats) = stats {
        server.stats.record_relay(request.cmd, stats);
        log::relay(&meta.peer_addr, request.cmd, &request.addr, &stats);
    }
    if let Err(e) = &result {
        log::debug!(
            peer = %meta.peer_addr,
            target = %request.addr,
            error = %e,
            "Relay ended with error"
        );
    }

    result
}
