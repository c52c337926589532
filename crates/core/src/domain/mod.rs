pub mod context;
pub mod health;
pub mod resource;
pub mod session;
