// folio-common: shared types for the Folio offline mutation pipeline.

pub mod protocol;
pub mod types;
