//! Veza inter-service communication layer.
//!
//! A durable, typed event bus over NATS JetStream that decouples the API
//! backend from the chat and stream subsystems, plus resilient gRPC clients
//! used to call those subsystems synchronously.

pub mod bus;
pub mod comms;
pub mod config;
pub mod events;
pub mod rpc;
pub mod status;
pub mod utils;

pub mod proto {
    pub mod chat {
        tonic::include_proto!("veza.chat");
    }

    pub mod stream {
        tonic::include_proto!("veza.stream");
    }
}
