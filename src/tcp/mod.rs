//! The TCP service layer: client connections and an accepting listener,
//! both built over the cooperative [`Scheduler`](crate::scheduler::Scheduler).

pub mod client;
pub mod connect;
pub mod listener;

pub use client::{ClosedReason, OnClosed as OnClientClosed, OnConnected, OnResponse, TcpClient};
pub use connect::{connect_timeout, ConnectCallback};
pub use listener::{
    OnClientConnected, OnClientDisconnected, OnClientRequest, OnClientWaiting, OnClosed, RemoteClientHandle,
    TcpListener,
};
