pub mod registry;
pub mod router;

pub use registry::{ConnectionRegistry, FreedRobot, Removal};
pub use router::{DropReason, EventRouter, Outcome, PeerReceiver, PeerSender, RouterError};
