//! SOCKS5 front-end (RFC 1928, CONNECT only, no authentication).
//!
//! Protocol handling lives entirely in this module; upstream connections
//! come from the [`Dialer`], which picks a network interface per request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dialer::Dialer;
use crate::error::{LinkmuxError, LinkmuxResult};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub struct ProxyServer {
    bind: SocketAddr,
    dialer: Arc<Dialer>,
}

impl ProxyServer {
    pub fn new(bind: SocketAddr, dialer: Arc<Dialer>) -> Self {
        Self { bind, dialer }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> LinkmuxResult<()> {
        let listener = TcpListener::bind(self.bind).await?;
        info!("SOCKS5 proxy listening on {}", self.bind);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Proxy server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (client, peer) = accepted?;
                    let dialer = self.dialer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(client, dialer).await {
                            debug!("Client {}: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_client(mut client: TcpStream, dialer: Arc<Dialer>) -> LinkmuxResult<()> {
    let address = handshake(&mut client).await?;

    let mut upstream = match dialer.dial_context(&address).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("No source could reach {}: {}", address, e);
            reply(&mut client, REPLY_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    reply(&mut client, REPLY_SUCCEEDED).await?;

    let _ = copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Negotiate the method selection and the CONNECT request; returns the
/// requested `host:port` destination.
async fn handshake(client: &mut TcpStream) -> LinkmuxResult<String> {
    // Version identifier and method selection.
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(LinkmuxError::proxy(format!(
            "unsupported SOCKS version {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client.write_all(&[SOCKS_VERSION, 0xff]).await?;
        return Err(LinkmuxError::proxy("no acceptable authentication method"));
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT.
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        reply(client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(LinkmuxError::proxy(format!(
            "unsupported command {}",
            request[1]
        )));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| LinkmuxError::proxy("domain name is not valid UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            format!("[{}]", std::net::Ipv6Addr::from(octets))
        }
        other => {
            return Err(LinkmuxError::proxy(format!(
                "unsupported address type {}",
                other
            )));
        }
    };

    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

async fn reply(client: &mut TcpStream, code: u8) -> LinkmuxResult<()> {
    // BND.ADDR/BND.PORT carry no meaning for CONNECT through this proxy.
    let response = [
        SOCKS_VERSION,
        code,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    client.write_all(&response).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{mock::MockSource, Source};
    use crate::store::SourceStore;

    async fn spawn_proxy() -> (SocketAddr, broadcast::Sender<()>) {
        let store = Arc::new(SourceStore::new());
        store.put(&[Arc::new(MockSource::active("s0")) as Arc<dyn Source>]);
        let dialer = Arc::new(Dialer::new(store));

        // Port 0 lets the OS pick; rebuild the server around the bound
        // listener to learn it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = broadcast::channel(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    accepted = listener.accept() => {
                        let Ok((client, _)) = accepted else { break };
                        let dialer = dialer.clone();
                        tokio::spawn(async move {
                            let _ = handle_client(client, dialer).await;
                        });
                    }
                }
            }
        });

        (addr, tx)
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (addr, _tx) = spawn_proxy().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Greeting: no-auth.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00]);

        // CONNECT example.com:443 by domain name.
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[0], 0x05);
        assert_eq!(response[1], REPLY_SUCCEEDED);
    }

    #[tokio::test]
    async fn test_rejects_wrong_version() {
        let (addr, _tx) = spawn_proxy().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        // The server drops the connection without a version-5 greeting.
        let mut buf = [0u8; 1];
        assert!(client.read_exact(&mut buf).await.is_err());
    }
}
