// Runtime-agnostic WebSocket transport layer.
//
// Presents one stable peer abstraction (`Connection`) and one lifecycle
// hook pipeline (`HookDispatcher`) regardless of which host runtime the
// socket came from. Three adapters translate their host's native
// upgrade/message/close APIs into that abstraction; everything above this
// crate only ever sees `Connection` and `Message`.

pub mod adapters;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod message;

pub use connection::{Connection, ConnectionContext, ConnectionId, SocketView, UpgradeRequest};
pub use error::TransportError;
pub use hooks::{
    CloseEvent, HookDispatcher, HookResolver, LifecycleHooks, RejectResponse, UpgradeOutcome,
};
pub use message::{Message, Payload};
