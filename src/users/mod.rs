pub mod dto;
pub mod handlers;
pub mod password;
pub mod repo;
pub mod service;

pub use handlers::router;
