#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod client;
pub mod error;
pub mod ws;

pub use client::Client;
pub use ws::{ConnectionState, Frame, GroupId, Handler};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
