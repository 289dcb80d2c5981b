pub mod memory;
pub mod message;
pub mod record;
pub mod topology;
