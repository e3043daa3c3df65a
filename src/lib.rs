pub mod cache;
pub mod catalog;
pub mod clips;
pub mod config;
pub mod downloads;
pub mod history;
pub mod music;
pub mod player;
pub mod profiles;
pub mod proxy;
pub mod ratings;
pub mod store;
pub mod types;
