pub mod discovery;
pub mod name_service;
pub mod provider;
pub mod remoting;
pub mod stream_service;
