//! Provider clients for asynchronous batch metadata generation.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AnthropicClient, BatchProvider};
pub use error::ProviderError;
pub use types::{
    BatchItem, BatchResult, BatchResultItem, ContentBlock, Message, MessageBatch,
    MessagesRequest, MessagesResponse, ProcessingStatus,
};
