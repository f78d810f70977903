//! Speech in and speech out.

pub mod deepgram;
pub mod recognition;
pub mod synthesis;
