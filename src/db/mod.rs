mod connection;
mod helpers;
mod migrations;
mod repositories;

pub use connection::Database;
