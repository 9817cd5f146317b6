pub mod broker;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod mentions;
pub mod models;
pub mod pagination;
pub mod passwords;
pub mod permissions;
pub mod timefmt;
pub mod web;
