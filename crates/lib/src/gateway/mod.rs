//! Gateway: HTTP + WebSocket front end for the push service.
//!
//! Single port serves HTTP and WebSocket. Protocol: first frame must be `connect`;
//! then requests (req/res) and events.

mod protocol;
mod server;

pub use protocol::{
    ConnectParams, FeedbackParams, HelloOk, NotifyParams, OneOrMany, ProvisionParams, WsError,
    WsRequest, WsResponse,
};
pub use server::run_gateway;
