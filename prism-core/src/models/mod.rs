pub mod cvr;
pub mod query;
pub mod row;
pub mod version;

pub use cvr::{ClientRecord, CvrSnapshot, QueryRecord, RowRecord};
pub use query::{Condition, QueryAst, QueryHash};
pub use row::{Row, RowId, RowKey, SqlValue, ROW_VERSION_COLUMN};
pub use version::{CvrVersion, StateVersion, VersionError};

/// Identifier of one client group. All clients of a group share a CVR and a
/// view-syncer instance.
pub type ClientGroupId = String;

/// Identifier of a single connected client within a group.
pub type ClientId = String;
