pub mod client_handlers;
pub mod gallery_handlers;
pub mod health_handlers;
pub mod object_handlers;
