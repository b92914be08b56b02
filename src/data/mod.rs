//! Dataset loading and prompt formatting.

pub mod records;
pub mod template;

pub use records::{load_csv, InstructionRecord};
pub use template::{ChatFamily, PromptTemplate};
