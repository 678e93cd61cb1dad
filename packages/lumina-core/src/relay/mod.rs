//! Session-scoped relay: wire frames, room registry and the fan-out hub.

pub mod frame;
pub mod hub;
pub mod registry;

pub use frame::{validate_inbound, Envelope, FrameKind, Role, ServerMessage};
pub use hub::{relay_channel, JoinRequest, RelayHub};
pub use registry::{ClientConnection, Outbound, RoomRegistry};
