//! Remote task dispatch.
//!
//! - [`types`]: wire types of the task-submission and infra protocols
//! - [`codec`]: versioned JSON / binary codecs for parameters and responses
//! - [`client`]: the [`TaskDispatchClient`] seam and its HTTP implementation
//! - [`dispatcher`]: encoding, callback-token caching and metrics around a client

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod types;

pub use client::{HttpDispatchClient, TaskDispatchClient};
pub use codec::{decode_envelope, BinaryCodec, Codec, CodecKind, JsonCodec};
pub use dispatcher::{TaskDispatcher, TaskRequest};
pub use types::{
    AccountScope, CallbackDescriptor, CallbackToken, CleanupRequest, EncodedParams,
    ExecuteRequest, InfraSpec, InitRequest, LiteEngineParams, LogConfig, ParkedTaskParams,
    TaskDescriptor, TaskExecutionStage, TaskMode, TaskType,
};
