pub mod content;
pub mod envelope;
pub mod payloads;

pub use content::Content;
pub use envelope::Message;
