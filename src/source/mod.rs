//! Implementations of entities, such as network interfaces, that are able
//! to create network connections, i.e. are "sources" of Internet.

pub(crate) mod bind;
pub mod conn;
pub mod interface;
pub mod listener;
pub mod provider;

pub use conn::{DataFlow, FlowKind, TrackedConn};
pub use interface::{DialHook, NetInterface};
pub use listener::{diff, HookErr, Hooker, Listener, POLL_INTERVAL, POLL_TIMEOUT};
pub use provider::{Confidence, InterfaceData, LocalProvider, SourceProvider};
