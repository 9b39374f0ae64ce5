//! Library crate for planning-poker-back: the relay server layers plus the per-client session engine.

pub mod client;
pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
