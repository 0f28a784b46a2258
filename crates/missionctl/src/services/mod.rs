pub mod admin;
pub mod coordination;
pub mod lifecycle;
pub mod provisioning;
pub mod session;
pub mod template_sync;
