pub mod locks;
pub mod protocol;
pub mod upload_service;
