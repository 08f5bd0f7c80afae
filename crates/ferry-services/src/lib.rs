//! Ferry Services Layer
//!
//! Orchestration of the upload pipeline: intake of resumable uploads, fan-out
//! replication to destination stores, status publication, and the read-side query
//! services. HTTP handling stays thin in ferry-api.

pub mod dispatcher;
pub mod intake;
pub mod publisher;
pub mod query;
pub mod routing;

pub use dispatcher::{DispatchConfig, ReplicationDispatcher};
pub use intake::{ChunkOutcome, IntakeSettings, SweeperHandle, UploadIntake};
pub use publisher::{PublisherTasks, StatusPublisher};
pub use query::{CopyStatusQueryService, TraceQueryService};
pub use routing::{RouteTarget, RoutingConfig, RoutingTable};
