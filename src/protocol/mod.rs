pub mod envelope;
pub mod msg_type;
