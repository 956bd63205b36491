pub mod pool;
pub mod protocol;
pub mod query;
pub mod runtime;
pub mod storage;
pub(crate) mod utilities;

pub use pool::{Connector, Pool, PoolConfig, PoolError, PoolRegistry};
pub use protocol::{Endpoint, EndpointHandle, Session, Stream, Tuple};
pub use query::{FeedOptions, FeedRegistry, QueryConnection, QueryError, QuerySource, SourceConfig, TableFeed};
pub use runtime::{Deferred, Scheduler};
pub use storage::{Row, Schema, StorageError, Table, TableOptions, Value};
