mod auth;
pub mod config;
mod error;
mod hasher;
mod middleware;
mod routes;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod telemetry;
mod token;
mod types;

pub use auth::*;
pub use error::*;
pub use hasher::*;
pub use middleware::*;
pub use routes::*;
pub use store::{InMemoryUserDatabase, SqliteUserDatabase, UserDatabase};
pub use token::*;
pub use types::*;
