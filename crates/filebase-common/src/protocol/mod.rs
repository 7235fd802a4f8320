pub mod correlation;
pub mod error;
pub mod frames;

#[cfg(test)]
mod tests;

pub use correlation::{correlation_id, CORRELATION_ID_LEN};
pub use error::{FilebaseError, Result};
pub use frames::{ChannelMessage, ERROR_FRAME_NAME};
