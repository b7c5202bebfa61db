//! Plain TCP side channel on which devices announce their MAC address.
//!
//! A device connects, writes its MAC as text and the server closes the
//! connection without replying. The source address is then bound to that
//! MAC so later `/pixel` requests without a `mac` parameter route to the
//! device's bucket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use photoframe_service::PhotoService;
use photoframe_types::{device::MacAddress, PhotoframeError, Result};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, info, warn};

/// At most this many bytes are read from a registration connection.
pub const REGISTRATION_BUFFER: usize = 32;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Decode a registration payload into a MAC address.
///
/// Invalid UTF-8 is replaced, surrounding whitespace dropped and the first
/// 17 characters of the upper-cased text parsed.
pub fn parse_registration(payload: &[u8]) -> Result<MacAddress> {
    let text = String::from_utf8_lossy(payload).trim().to_uppercase();
    let candidate = text
        .char_indices()
        .nth(MacAddress::TEXT_LEN)
        .map_or(text.as_str(), |(end, _)| &text[..end]);
    candidate.parse().map_err(|_| {
        PhotoframeError::Registry(format!("invalid registration payload {candidate:?}"))
    })
}

/// Accept registrations until the listener fails.
pub async fn serve_registration(listener: TcpListener, service: Arc<PhotoService>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Registration listener on {addr}");
    }
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Registration accept failed: {err}");
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_registration(stream, peer, &service).await {
                warn!("Registration from {} rejected: {err}", peer.ip());
            }
        });
    }
}

async fn handle_registration(
    mut stream: TcpStream,
    peer: SocketAddr,
    service: &PhotoService,
) -> Result<()> {
    let payload = timeout(READ_TIMEOUT, read_payload(&mut stream))
        .await
        .map_err(|_| PhotoframeError::Network("registration read timed out".into()))?
        .map_err(|err| PhotoframeError::Network(format!("registration read failed: {err}")))?;
    debug!("Registration payload from {}: {:?}", peer, payload);

    let mac = parse_registration(&payload)?;
    service.register_address(peer.ip().to_canonical(), mac)?;
    Ok(())
}

/// Read until a full MAC is buffered, the peer closes or the buffer fills.
async fn read_payload(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; REGISTRATION_BUFFER];
    let mut filled = 0;
    while filled < buf.len() {
        let read = stream.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
        if String::from_utf8_lossy(&buf[..filled]).trim().len() >= MacAddress::TEXT_LEN {
            break;
        }
    }
    Ok(buf[..filled].to_vec())
}
