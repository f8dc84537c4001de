//! Payload MIME sniffing and `data:` URL encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub const MIME_WAV: &str = "audio/wav";
pub const MIME_FLAC: &str = "audio/flac";
pub const MIME_MPEG: &str = "audio/mpeg";
pub const MIME_OGG: &str = "audio/ogg";
pub const MIME_MP4: &str = "audio/mp4";

/// Guess the container from the leading magic bytes.
///
/// Unrecognised payloads are labelled `audio/wav`, which is what most
/// audio-capable endpoints assume anyway.
///
/// ```
/// use batch_captioner::audio::detect_mime;
///
/// assert_eq!(detect_mime(b"fLaC\0\0\0\x22"), "audio/flac");
/// assert_eq!(detect_mime(b"????"), "audio/wav");
/// ```
pub fn detect_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"fLaC") {
        MIME_FLAC
    } else if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        MIME_MPEG
    } else if bytes.starts_with(b"OggS") {
        MIME_OGG
    } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WAVE".as_slice()) {
        MIME_WAV
    } else if bytes.get(4..8) == Some(b"ftyp".as_slice()) {
        MIME_MP4
    } else {
        MIME_WAV
    }
}

/// Encode `bytes` as `data:<mime>;base64,<payload>`.
pub fn to_data_url(bytes: &[u8], mime: &str) -> String {
    let prefix = format!("data:{mime};base64,");
    let mut url = String::with_capacity(prefix.len() + bytes.len().div_ceil(3) * 4);
    url.push_str(&prefix);
    STANDARD.encode_string(bytes, &mut url);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_containers() {
        assert_eq!(detect_mime(b"fLaC...."), MIME_FLAC);
        assert_eq!(detect_mime(b"ID3\x04...."), MIME_MPEG);
        assert_eq!(detect_mime(&[0xFF, 0xFB, 0x90, 0x00]), MIME_MPEG);
        assert_eq!(detect_mime(b"OggS\0\x02"), MIME_OGG);
        assert_eq!(detect_mime(b"RIFF\x24\0\0\0WAVEfmt "), MIME_WAV);
        assert_eq!(detect_mime(b"\0\0\0\x20ftypM4A "), MIME_MP4);
    }

    #[test]
    fn short_or_unknown_payloads_default_to_wav() {
        assert_eq!(detect_mime(b""), MIME_WAV);
        assert_eq!(detect_mime(b"RIFF"), MIME_WAV);
        assert_eq!(detect_mime(b"garbage!"), MIME_WAV);
    }

    #[test]
    fn data_url_has_prefix_and_base64_body() {
        assert_eq!(to_data_url(b"hello", MIME_OGG), "data:audio/ogg;base64,aGVsbG8=");
        assert_eq!(to_data_url(b"", MIME_WAV), "data:audio/wav;base64,");
    }
}
