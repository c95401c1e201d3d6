pub mod core;
pub mod requests;
pub mod router;
pub mod streamer;
pub mod wire;

pub use self::core::{ForwardOutcome, ProxyCore};
pub use self::requests::{ActiveRequests, BackendRequestCounter};
pub use self::router::Router;
pub use self::streamer::{GatewayStatus, GatewayStreamer};
pub use self::wire::{ContentEncoding, STATUS_HIGH_LOAD, STATUS_SHUTDOWN};
