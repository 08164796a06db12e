//! kvfs Key-Value Layer
//!
//! The filesystem engine is written against a small capability set rather
//! than a vendor API:
//!
//! - point get by `(partition, sort)` key with optional attribute projection
//! - conditional put, update and delete
//! - paginated range query within one partition, filtered on the sort key
//! - atomic increment-and-return on a single row
//!
//! ```text
//! ┌──────────────────┐
//! │   kvfs-engine    │
//! └────────┬─────────┘
//!          │ Arc<dyn KvBackend>
//! ┌────────▼─────────┐
//! │  TimeoutBackend  │  (optional call deadline)
//! └────────┬─────────┘
//!    ┌─────┴──────┐
//! ┌──▼───┐    ┌───▼────┐
//! │Memory│    │  Redb  │
//! └──────┘    └────────┘
//! ```

pub mod backend;
pub mod error;
pub mod tables;
pub mod types;

pub use backend::factory::open_backend;
pub use backend::memory::MemoryBackend;
pub use backend::redb_backend::RedbBackend;
pub use backend::timeout::TimeoutBackend;
pub use backend::KvBackend;
pub use error::{KvError, KvResult};
pub use types::{
    AttrValue, Attrs, Condition, Conditional, Item, ItemKey, Page, SortCondition, UpdateOp,
};
