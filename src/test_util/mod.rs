//! This module contains utilities that are useful for testing code based on reliable delivery.
//!  They are used for testing the controllers themselves, but they are also exported for
//!  application testing.

pub mod recording_links;
pub mod unreliable_links;
