pub mod browse_messages;
pub mod cursor;
