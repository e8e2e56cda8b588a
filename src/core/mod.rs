pub mod config;
pub mod credentials;
pub mod crm;
pub mod deals;
pub mod error;
pub mod oauth;
pub mod terminal;
