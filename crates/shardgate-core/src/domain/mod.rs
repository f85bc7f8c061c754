//! Domain model: change sets, mappings, selections, shard results, reports.

pub mod change_set;
pub mod error;
pub mod mapping;
pub mod report;
pub mod selection;
pub mod shard;
pub mod test_id;

pub use change_set::{normalize_path, ChangeSet, PathFilter};
pub use error::{Result, ShardgateError};
pub use mapping::{TestMapping, MAPPING_SCHEMA_VERSION};
pub use report::{
    CombinedReport, FailureClass, NewFailure, NewFailureReport, ShardFailure, ShardStatus,
    ShardSummary,
};
pub use selection::{PartitionStrategy, Shard, TestSelection};
pub use shard::{ShardResult, TestRecord};
pub use test_id::{Backend, Outcome, OutcomeCounts, TestId};
