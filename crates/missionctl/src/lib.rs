#![recursion_limit = "256"]

pub mod activity;
pub mod app;
pub mod auth;
pub mod db;
pub mod db_ops;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod queue;
pub mod services;
pub mod tokens;

pub use missionctl_models as models;
