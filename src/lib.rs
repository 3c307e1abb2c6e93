pub mod api;
pub mod app_state;
pub mod auth;
pub mod certificates;
pub mod config;
pub mod countdown;
pub mod error;
pub mod models;
pub mod quiz;
pub mod routes;
pub mod signals;
pub mod storage;
pub mod views;
