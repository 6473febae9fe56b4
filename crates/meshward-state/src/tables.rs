//! redb table definitions.

use redb::TableDefinition;

/// Last known client addresses keyed by client identity.
pub const ADDRESSES: TableDefinition<&str, &[u8]> = TableDefinition::new("addresses");
