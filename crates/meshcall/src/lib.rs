//! # Meshcall
//!
//! Call correlation and routing for a mesh of cooperating nodes.
//!
//! A [`Dispatcher`] owns one connection's worth of state: the
//! [`PendingCalls`] table correlating replies to calls by sequence id, and a
//! shared [`NodeRegistry`] tracking which node serves which method and which
//! nodes recently failed. On top of those it offers two call shapes:
//!
//! - **Fan-out** ([`Dispatcher::call`]): one frame to many nodes, replies gathered
//!   into a per-node map. Partial results are not an error.
//! - **Failover** ([`Dispatcher::call_one`]): healthy candidates tried one at a time
//!   until one answers.
//!
//! Transports only move bytes. They implement [`Transport`] for sending and feed
//! inbound frames back through [`Dispatcher::on_frame_received`] (or a pump, see
//! [`Dispatcher::spawn_pump`]).

pub mod builder;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod mesh;
pub mod nodes;
pub mod pending;
pub mod service;
pub mod transport;

pub use builder::ConfigError;
pub use builder::DispatcherBuilder;
pub use builder::DispatcherConfig;
pub use codec::Codec;
pub use codec::CodecError;
pub use codec::JsonCodec;
pub use codec::RawCodec;
pub use dispatcher::Dispatcher;
pub use dispatcher::FanOut;
pub use error::ApplicationError;
pub use error::Error;
pub use error::Result;
pub use membership::Membership;
pub use membership::StaticMembership;
pub use mesh::MemoryMesh;
pub use mesh::MeshTransport;
pub use nodes::NodeHealth;
pub use nodes::NodeRegistry;
pub use pending::PendingCalls;
pub use pending::PendingReply;
pub use pending::Response;
pub use service::Handler;
pub use service::handler_fn;
pub use transport::Address;
pub use transport::CallOptions;
pub use transport::Inbound;
pub use transport::Recipients;
pub use transport::ResponseMode;
pub use transport::SendHints;
pub use transport::Transport;
pub use transport::TransportError;

pub use meshframe::FrameKind;
pub use meshframe::SeqId;
