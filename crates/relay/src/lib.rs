// folio-relay: server-side idempotent replay store.
//
// Lets the relay recognize re-delivery of the same logical mutation and
// answer with the originally computed response instead of re-executing
// the side effect.

pub mod error;
pub mod idempotency;
