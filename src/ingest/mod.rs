//! Ingestion of external change records.
//!
//! Records come from an append-only file or a polled Redis instance. Each one
//! describes an entity after a change; the [`Connector`] turns it into an
//! entity creation or a new state, and creates the relationships it embeds.

pub mod connector;
pub mod record;
pub mod semantic_action;
pub mod source;

pub use connector::{Connector, IngestReport};
pub use record::{ChangeRecord, RelatedLink};
#[cfg(feature = "redis")]
pub use source::RedisSource;
pub use source::{AofSource, RecordSource};
