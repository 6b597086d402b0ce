// CRDT document synchronization engine.
//
// Documents are yrs `Doc`s addressed by name through a
// `DocumentRegistry`; connected peers speak the Yjs binary sync and
// awareness protocol over any `quillstream-transport` adapter via
// `CollabHooks`. Persistence and content bootstrap are pluggable
// through the `DocStorage` and `ContentLoader` traits.

pub mod collab;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod shared_doc;

pub use collab::CollabHooks;
pub use error::EngineError;
pub use persistence::{ContentLoader, DocStorage, MemoryStorage};
pub use registry::DocumentRegistry;
pub use shared_doc::SharedDoc;
