pub mod client;

pub use client::{RpcHealth, RpcLoadBalancer, WsClient};
