pub mod auth;
pub mod ceremony;
pub mod constants;
pub mod db;
pub mod logging;
pub mod rest;
pub mod server;
pub mod settings;
pub mod supervisor;
pub mod ws;
