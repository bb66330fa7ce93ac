mod gguf;
mod gguf_utils;
mod types;
mod writer;

pub use types::{GGUFError, GGUFValue, GGUFValueType, GGMLType, TensorInfo};
pub use gguf::GGUFReader;
pub use gguf_utils::{is_gguf_file, GGUF_MAGIC};
pub use writer::GGUFWriter;
