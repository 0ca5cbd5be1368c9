//! Reverse-tunnel HTTP broker over iroh connections.
//!
//! A [`BrokerServer`] accepts client connections and relays external HTTP calls
//! addressed to `/broker/{token}/...` to the client identified by that token. A
//! [`BrokerClient`] serves those calls against its local origins, filtered by its
//! accept rules, and can relay local calls back to the server's origins.

pub mod channel;
pub mod client;
mod config;
mod error;
pub mod filter;
pub mod forward;
pub mod frame;
pub mod gateway;
pub mod mux;
pub mod parse;
pub mod registry;
pub mod server;


pub use {
    client::{BrokerClient, ClientOpts},
    config::ConfigError,
    error::ExchangeError,
    filter::{AcceptConfig, Rule, Ruleset},
    forward::{Forwarder, Pipeline, PipelineOpts, Variables},
    frame::Side,
    gateway::{GatewayOpts, IngressGateway, ResolveConnection, TokenPath, UpstreamConnection},
    registry::{Connection, ConnectionSummary, Identify, Liveness, Metadata, Registry},
    server::{ALPN, BrokerServer, ServerOpts},
};
