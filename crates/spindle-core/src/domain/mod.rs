//! Domain model: ids, task codes, task state, end points, RPC messages.

pub mod end_point;
pub mod ids;
pub mod message;
pub mod state;
pub mod task;

pub use end_point::EndPoint;
pub use ids::{CorrelationId, FileHandle, Id, IdMarker, TaskId};
pub use message::{Message, MessageHeader, MessageKind};
pub use state::TaskState;
pub use task::TaskCode;
