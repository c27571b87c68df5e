pub mod admin_service;
pub mod client;
pub mod convert;
pub mod raft_service;
pub mod server;

pub use admin_service::ClientService;
pub use client::GrpcTransport;
pub use raft_service::PeerService;
pub use server::GrpcServer;
