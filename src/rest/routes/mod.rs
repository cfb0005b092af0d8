pub mod account;
pub mod machines;
pub mod sessions;
