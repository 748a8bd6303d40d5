//! Face-swap job service: asynchronous orchestration of long-running
//! face-swap jobs behind a small HTTP API.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod processor;
pub mod service;
pub mod storage;
