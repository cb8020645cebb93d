// ABOUTME: Library crate for chess-engine-service exposing the orchestrator, boundary and CLI

#![allow(missing_docs)]

pub mod api;
pub mod cli;
pub mod config;
pub mod engine_pool;
