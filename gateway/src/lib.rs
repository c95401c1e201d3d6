pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod traits;

pub use admin::{AdminPlane, HealthEndpoint};
pub use cache::{CachedResponseMetadata, ResponseCache};
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use proxy::{ContentEncoding, ProxyCore, Router};
pub use registry::{Backend, Service, ServiceRegistry, StaticRegistry};
pub use traits::{
    ClientRequest, ContentStream, GatewayReply, ReplyBody, RequestHandler, StreamChunk,
};
