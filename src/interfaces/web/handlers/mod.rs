pub mod health;
pub mod install;
pub mod tokens;
