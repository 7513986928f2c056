// folio-client: offline-first mutation pipeline.
//
// A durable client-side queue of not-yet-confirmed writes, an idempotency
// protocol so the relay applies each write at most once under retries, and
// a replay engine reconciling the queue against the network.

pub mod events;
pub mod mutation;
pub mod queue;
pub mod replay;
pub mod scheduler;
pub mod store;
