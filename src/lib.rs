//! Public API for the `gosoc` library.
//!
//! A connection-oriented TCP request/response framework speaking the GOSOC
//! length-delimited binary protocol. Each connection authenticates once,
//! then carries correlated request/response pairs, server pushes, and
//! keep-alive pings; duplicate logins kick out their predecessor, and the
//! server restarts gracefully by handing its listener fd to a replacement
//! process while in-flight sessions drain.

pub mod access;
pub mod app;
pub mod client;
pub mod connection;
pub mod controller;
pub mod error;
mod handler;
pub mod listener;
pub mod packet;
pub mod registry;
pub mod restart;
mod server;
pub mod user;

pub use access::{AccessLog, AccessRecord, LogAccessLog};
pub use app::{App, AppConfig};
pub use client::{Client, ClientConn, ClientError, ClientEvents};
pub use connection::SessionHandle;
pub use controller::{
    ActionContext,
    ActionError,
    ActionResult,
    Controller,
    Dispatcher,
    ResponseBody,
    Status,
    decode_params,
};
pub use error::AppError;
pub use packet::{Packet, ProtocolError, ReturnCode};
pub use registry::OnlineRegistry;
pub use restart::{RestartManager, RestartWait};
pub use user::{SimpleUser, UserAuth};
