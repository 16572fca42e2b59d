// Library for tests and the binary to access modules

pub mod buffer;
pub mod config;
pub mod connectivity;
pub mod gateway;
pub mod maintenance;
pub mod models;
pub mod retry;
pub mod routes;
pub mod sampler;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod version;
