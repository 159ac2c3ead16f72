//! remote-uptime: reports system uptime to TCP clients.
//!
//! A client connects, sends `GET_SYS_INFO\n` and receives the output of
//! `uptime`. Every connection is served by its own worker:
//!
//! - `server`: listener and dispatcher loop
//! - `worker`: isolation units (process or thread) per connection
//! - `handler`: the one-request protocol run inside a worker
//! - `reaper`: reclamation of terminated worker processes
//! - `client`: the requesting side

pub mod client;
pub mod config;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod reaper;
pub mod server;
pub mod worker;
