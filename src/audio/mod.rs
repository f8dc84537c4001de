//! Audio payload helpers.
//!
//! This module provides:
//! * [`detect_mime`] / [`to_data_url`]: how clip bytes are labelled and
//!   embedded in a captioning request.
//! * [`AudioDecoder`]: the duration-probing capability, selected once per
//!   run by [`select_decoder`] and only used when duration sampling is on.

pub mod decode;
pub mod mime;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use decode::{
    select_decoder, AudioDecoder, DecodeError, FallbackDecoder, SymphoniaDecoder, WavDecoder,
};
pub use mime::{detect_mime, to_data_url};
