pub mod batch;
pub mod config;
pub mod error;
pub mod group;
pub mod message;
pub mod predicate;
pub mod task;
pub mod value;

pub use batch::{point_from_json, point_to_json, BufferedBatch};
pub use config::{ConfigService, ConfigSnapshot, Override, RuntimeConfig};
pub use error::CoreError;
pub use group::{group_id, Dimensions, Fields, GroupId, GroupInfo, Tags};
pub use message::{
    Barrier, BatchPoint, BeginBatch, DeleteGroup, EdgeType, EndBatch, Message, MessageKind, Point,
};
pub use predicate::{CmpOp, Predicate};
pub use task::{AlertSpec, Dbrp, NodeDef, NodeSpec, TaskDefinition, UdfSpec, TASK_IN, TASK_OUT};
pub use value::FieldValue;
