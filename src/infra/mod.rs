//! Adapters for the catalogue, the work queue table and outbound transfers.

pub mod persistence;
pub mod queue;
pub mod transport;

pub use persistence::{InMemoryCatalogue, PersistentStore, StudyStorage, UpdateContext};
pub use queue::{FileWorkQueueStore, InMemoryWorkQueueStore, WorkQueueStore};
pub use transport::{ConnectionMonitor, DirectoryTransport, Transport};
