pub mod llm_client;

pub use llm_client::{ChatBackend, OpenAiCompatClient, OpenAiConnector, ProviderConnector, RequestOptions};
