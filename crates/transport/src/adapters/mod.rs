// Host runtime adapters.
//
// Each adapter translates one host's native upgrade/socket API into the
// shared `Connection` + `HookDispatcher` contract. They all preserve the
// same event ordering: upgrade resolution, then (on success) one `open`,
// zero or more `message` events, and at most one `error` followed by
// exactly one `close`.

#[cfg(feature = "actix")]
pub mod actix;
#[cfg(feature = "axum")]
pub mod axum;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

#[cfg(feature = "actix")]
pub use actix::ActixAdapter;
#[cfg(feature = "axum")]
pub use axum::AxumAdapter;
#[cfg(feature = "tungstenite")]
pub use tungstenite::TungsteniteAdapter;
