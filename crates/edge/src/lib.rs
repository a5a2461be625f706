pub mod consumer;
pub mod edge;
pub mod error;
pub mod grouped;
pub mod multi;
pub mod stats;

pub use consumer::{
    dispatch, Consumer, ForwardReceiver, ForwardingReceiver, Receiver,
};
pub use edge::{ChannelEdge, Edge};
pub use error::EdgeError;
pub use grouped::{GroupedConsumer, GroupedReceiver};
pub use multi::{MultiConsumer, MultiReceiver};
pub use stats::{GroupStats, StatsEdge};
