pub mod chat;
pub mod fallback;
pub mod pages;
pub mod status;
