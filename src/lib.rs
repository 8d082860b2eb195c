#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod cgi;
pub mod config;
pub mod conn;
pub mod engine;
mod error;
pub mod handler;
pub mod master;
pub mod meta;
pub mod net;
pub mod pool;
pub mod request;
pub mod status;
pub mod worker;

pub use crate::{
    config::{PoolConfig, ProcessManager, ServerConfig},
    conn::FcgiConnection,
    engine::{EchoEngine, EngineFactory, ScriptEngine},
    error::*,
    master::Master,
    pool::WorkerPool,
    request::FcgiRequest,
    status::StatusSnapshot,
};
