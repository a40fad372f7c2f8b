#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;

pub mod api;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod engine;
mod error;
pub mod logging;
pub mod periodic;
pub mod subscriber;
pub mod tcp;
pub mod udp;

pub use error::Error;
pub use subscriber::Subscriber;
