// Worker-facing dispatch: transport client and result normalization

pub mod client;
pub mod dispatcher;

pub use client::{HttpProcessorClient, ProcessorClient, ResultStream, ndjson_results};
pub use dispatcher::Dispatcher;
