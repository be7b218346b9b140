pub mod server;
pub mod worker_service;

pub use server::GrpcServer;
pub use worker_service::WorkerServiceImpl;
