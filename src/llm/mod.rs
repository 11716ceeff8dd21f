//! 推理客户端：抽象、OpenAI 兼容实现、Mock

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockFailure, MockLlmClient, MockReply};
pub use openai::{OpenAiClient, Pricing};
pub use traits::{estimate_confidence, Inference, LlmClient, Mode};
