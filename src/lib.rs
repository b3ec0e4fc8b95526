//! shmtask - offload bounded data transformations to long-lived workers
//! through a fixed-capacity task queue in shared memory.
//!
//! A producer reserves an empty slot, writes its input and operation, and
//! polls until a worker has written back a result or an error. Workers run
//! as processes attached to a file-backed region (or as threads sharing an
//! anonymous one) and apply a [`transform::Transform`] to each request.
//!
//! ```no_run
//! use shmtask::config::{PoolConfig, QueueConfig, WorkerMode};
//! use shmtask::lifecycle::{Controller, RegionSpec};
//! use shmtask::records::RequestData;
//!
//! let pool = PoolConfig::default().with_mode(WorkerMode::Thread).with_workers(2);
//! let mut controller = Controller::start(RegionSpec::Anonymous, &QueueConfig::default(), pool)?;
//! let records = controller
//!     .submitter()
//!     .transform(&RequestData::from_json_str("[1,2,3,4,5]"), "increment by 10")?;
//! assert_eq!(records.len(), 5);
//! controller.shutdown()?;
//! # Ok::<(), shmtask::error::ShmtaskError>(())
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod paths;
pub mod queue;
pub mod records;
pub mod submit;
pub mod transform;
pub mod wait;
pub mod worker;

pub use config::{PoolConfig, QueueConfig, WorkerMode};
pub use error::{Result, ShmtaskError};
pub use lifecycle::{Controller, RegionSpec};
pub use queue::{SharedRegion, SlotHandle, SlotState, TaskQueue};
pub use submit::{CancelToken, Submitter};
