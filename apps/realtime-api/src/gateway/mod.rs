pub mod authz;
pub mod backplane;
pub mod events;
pub mod handler;
pub mod hub;
pub mod notify;
pub mod persist;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod session;
