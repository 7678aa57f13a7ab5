//! Containers and selection machinery for entities able to provide
//! network connections, i.e. "sources" of Internet.

pub mod balancer;
pub mod ring;

pub use balancer::{Balancer, RoundRobin, Strategy};
pub use ring::Ring;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::LinkmuxResult;

/// Object-safe connection handed back by a source.
pub trait SourceConn: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> SourceConn for T {}

/// Boxed connection, the currency between sources and the proxy layer.
pub type BoxConn = Box<dyn SourceConn>;

/// An entity that is able to provide network connections.
///
/// Implementations are the OS-backed `source::NetInterface` and the test
/// mocks; the balancer, store and dialer only ever see this trait.
#[async_trait]
pub trait Source: Send + Sync {
    /// Uniquely identifies the source, e.g. the interface device name.
    fn id(&self) -> &str;

    /// Dial a connection to `address` using the given network
    /// ("tcp", "tcp4" or "tcp6"), bound to whatever the source represents.
    async fn dial(&self, network: &str, address: &str) -> LinkmuxResult<BoxConn>;

    /// Close every connection the source is tracking. Closing twice is a
    /// no-op for the connections already gone.
    fn close(&self);

    /// Number of connections the source is currently tracking.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
