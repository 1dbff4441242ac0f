pub mod config;
pub mod db;
pub mod forwarder;
pub mod lifecycle;
pub mod link;
pub mod management;
pub mod models;
pub mod pem;
pub mod registry;
pub mod rest_server;
pub mod subscriptions;
pub mod supervisor;
