// Table and summary output
mod display;

// Interactive loop
mod chat;

pub use chat::chat_loop;
pub use display::{display_gguf, display_model_info, gguf_json};
