//! Platform-specific socket binding. This is the only place where the
//! per-OS differences in tying an outgoing socket to an interface live;
//! the rest of the crate calls [`bind_to_interface`] and stays portable.

use std::net::IpAddr;

use tokio::net::TcpSocket;

use crate::error::{LinkmuxError, LinkmuxResult};

/// Arrange for the socket to route through the interface `name` before
/// connecting. On Linux this binds the socket to the device; elsewhere it
/// binds the local address to the interface's primary IPv4 address.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn bind_to_interface(
    socket: &TcpSocket,
    name: &str,
    _addrs: &[IpAddr],
) -> LinkmuxResult<()> {
    socket.bind_device(Some(name.as_bytes())).map_err(|e| {
        LinkmuxError::dial(
            name,
            "",
            format!("unable to bind socket to device {}: {}", name, e),
        )
    })
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) fn bind_to_interface(
    socket: &TcpSocket,
    name: &str,
    addrs: &[IpAddr],
) -> LinkmuxResult<()> {
    use std::net::SocketAddr;

    let ip = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .copied()
        .ok_or_else(|| {
            LinkmuxError::dial(
                name,
                "",
                format!("no IPv4 address available on interface {}", name),
            )
        })?;

    socket.bind(SocketAddr::new(ip, 0)).map_err(|e| {
        LinkmuxError::dial(
            name,
            "",
            format!("unable to bind socket to address {}: {}", ip, e),
        )
    })
}

#[cfg(target_os = "windows")]
pub(crate) fn bind_to_interface(
    _socket: &TcpSocket,
    name: &str,
    _addrs: &[IpAddr],
) -> LinkmuxResult<()> {
    Err(LinkmuxError::dial(
        name,
        "",
        "interface binding is not implemented on Windows",
    ))
}
