pub mod auth;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod external;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod store;
