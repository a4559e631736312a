//! 虫后(Queen): 节点连接的驱动端

pub mod channel;
pub mod dispatcher;
pub mod distance;
pub(crate) mod expiration;
pub(crate) mod handler;
pub mod idle;
pub mod kind;
pub mod network;
pub mod reservation;
pub mod state;

pub use channel::{ChannelView, ExecutionStatus, NodeChannel, ReservationTransition};
pub use dispatcher::{DispatcherSignal, JobDispatcher};
pub use distance::{ConfigDistance, PropertyDistance};
pub use kind::ChannelKind;
pub use reservation::{NodeReservationHandler, ReservationSnapshot};
pub use state::{NodeAction, NodeEvent, NodeState};
