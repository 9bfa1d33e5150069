//! HTTP front-end: the pingora gateway and the echo endpoint.

mod gateway;

pub use gateway::EdgeGateway;
