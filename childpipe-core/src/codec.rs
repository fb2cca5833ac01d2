//! Byte/text transcoding for the child's stdio streams.
//!
//! A [`TextCodec`] is bound to one code page. The stateless
//! [`encode`](TextCodec::encode)/[`decode`](TextCodec::decode) pair replaces
//! malformed input with U+FFFD, so decoding arbitrary chunks independently may
//! split a multi-byte character. The drain loop uses [`StreamDecoder`] instead,
//! which carries incomplete sequences over to the next chunk.

use std::borrow::Cow;
use std::fmt;

use encoding_rs::{Decoder, Encoding, EncoderResult, UTF_8};

use crate::error::{Result, SupervisorError};

/// Label selecting the process code page.
pub use childpipe_config::constants::SYSTEM_CODE_PAGE;

/// Converts between text and the bytes of a fixed code page.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TextCodec {
    encoding: &'static Encoding,
}

impl fmt::Debug for TextCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextCodec")
            .field("encoding", &self.encoding.name())
            .finish()
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::utf8()
    }
}

impl TextCodec {
    pub fn utf8() -> Self {
        Self { encoding: UTF_8 }
    }

    /// Resolve a code page from a WHATWG label (`"euc-kr"`), a numeric Windows
    /// code page (`"949"`), or [`SYSTEM_CODE_PAGE`].
    pub fn from_label(label: &str) -> Result<Self> {
        let trimmed = label.trim();
        if trimmed.eq_ignore_ascii_case(SYSTEM_CODE_PAGE) {
            return Ok(Self::system());
        }

        if let Ok(code_page) = trimmed.parse::<u32>() {
            return Self::from_code_page(code_page)
                .ok_or_else(|| SupervisorError::UnknownCodePage(trimmed.to_string()));
        }

        Encoding::for_label(trimmed.as_bytes())
            .filter(|encoding| encoding.output_encoding() == *encoding)
            .map(|encoding| Self { encoding })
            .ok_or_else(|| SupervisorError::UnknownCodePage(trimmed.to_string()))
    }

    /// Map a Windows code page number onto its encoding.
    pub fn from_code_page(code_page: u32) -> Option<Self> {
        encoding_for_code_page(code_page).map(|encoding| Self { encoding })
    }

    /// The code page the current process uses for narrow text.
    pub fn system() -> Self {
        Self {
            encoding: system_encoding(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encode `text` for the child. Characters the code page cannot represent
    /// become `?`.
    pub fn encode<'a>(&self, text: &'a str) -> Cow<'a, [u8]> {
        let (bytes, _, had_unmappable) = self.encoding.encode(text);
        if !had_unmappable {
            return bytes;
        }

        let mut encoder = self.encoding.new_encoder();
        let mut out = Vec::with_capacity(text.len());
        let mut remaining = text;
        loop {
            let needed = encoder
                .max_buffer_length_from_utf8_without_replacement(remaining.len())
                .unwrap_or(remaining.len().saturating_mul(4));
            out.reserve(needed);
            let (result, read) =
                encoder.encode_from_utf8_to_vec_without_replacement(remaining, &mut out, true);
            remaining = &remaining[read..];
            match result {
                EncoderResult::InputEmpty => break,
                EncoderResult::OutputFull => {}
                EncoderResult::Unmappable(_) => out.push(b'?'),
            }
        }
        Cow::Owned(out)
    }

    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        let (text, _) = self.encoding.decode_without_bom_handling(bytes);
        text
    }

    pub fn stream_decoder(&self) -> StreamDecoder {
        StreamDecoder::new(*self)
    }
}

/// Incremental decoder that defers partial multi-byte sequences between chunks.
pub struct StreamDecoder {
    codec: TextCodec,
    decoder: Decoder,
}

impl fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("codec", &self.codec)
            .finish()
    }
}

impl StreamDecoder {
    fn new(codec: TextCodec) -> Self {
        Self {
            codec,
            decoder: codec.encoding.new_decoder_without_bom_handling(),
        }
    }

    /// Decode the next chunk. Trailing bytes of an incomplete character are kept
    /// until the following call.
    pub fn decode_chunk(&mut self, bytes: &[u8]) -> String {
        self.decode_inner(bytes, false)
    }

    /// Flush whatever is still pending. Incomplete sequences become U+FFFD.
    /// The decoder is ready for a fresh stream afterwards.
    pub fn finish(&mut self) -> String {
        let tail = self.decode_inner(&[], true);
        self.decoder = self.codec.encoding.new_decoder_without_bom_handling();
        tail
    }

    fn decode_inner(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or_else(|| bytes.len().saturating_mul(3).saturating_add(16));
        let mut text = String::with_capacity(capacity);
        let (_, read, _) = self.decoder.decode_to_string(bytes, &mut text, last);
        debug_assert_eq!(read, bytes.len());
        text
    }
}

fn encoding_for_code_page(code_page: u32) -> Option<&'static Encoding> {
    let label: &[u8] = match code_page {
        65001 => b"utf-8",
        1252 => b"windows-1252",
        866 => b"ibm866",
        874 => b"windows-874",
        932 => b"shift_jis",
        936 => b"gbk",
        949 => b"euc-kr",
        950 => b"big5",
        1250 => b"windows-1250",
        1251 => b"windows-1251",
        1253 => b"windows-1253",
        1254 => b"windows-1254",
        1255 => b"windows-1255",
        1256 => b"windows-1256",
        1257 => b"windows-1257",
        1258 => b"windows-1258",
        20866 => b"koi8-r",
        21866 => b"koi8-u",
        28591 => b"iso-8859-1",
        28592 => b"iso-8859-2",
        28595 => b"iso-8859-5",
        28597 => b"iso-8859-7",
        28605 => b"iso-8859-15",
        51932 => b"euc-jp",
        54936 => b"gb18030",
        _ => return None,
    };
    Encoding::for_label(label)
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn system_encoding() -> &'static Encoding {
    let code_page = unsafe { winapi::um::winnls::GetACP() };
    encoding_for_code_page(code_page).unwrap_or(UTF_8)
}

#[cfg(not(windows))]
fn system_encoding() -> &'static Encoding {
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
        .and_then(|locale| charset_from_locale(&locale))
        .unwrap_or(UTF_8)
}

/// Extract the charset part of a POSIX locale name such as `ko_KR.EUC-KR@euro`.
#[cfg(not(windows))]
fn charset_from_locale(locale: &str) -> Option<&'static Encoding> {
    let (_, rest) = locale.split_once('.')?;
    let charset = rest.split('@').next().unwrap_or(rest);
    // glibc spells UTF-8 as "utf8".
    if charset.eq_ignore_ascii_case("utf8") {
        return Some(UTF_8);
    }
    Encoding::for_label(charset.as_bytes())
        .filter(|encoding| encoding.output_encoding() == *encoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn utf8_round_trips_hangul() {
        let codec = TextCodec::utf8();
        let bytes = codec.encode("안녕, 세상!");
        assert_eq!(codec.decode(&bytes), "안녕, 세상!");
    }

    #[test]
    fn numeric_code_page_resolves() -> Result<()> {
        let codec = TextCodec::from_label("949")?;
        assert_eq!(codec.name(), "EUC-KR");
        // "가" is 0xB0 0xA1 in EUC-KR.
        assert_eq!(codec.encode("가").as_ref(), &[0xB0, 0xA1]);
        assert_eq!(codec.decode(&[0xB0, 0xA1]), "가");
        Ok(())
    }

    #[test]
    fn unmappable_characters_encode_as_question_marks() -> Result<()> {
        let codec = TextCodec::from_label("windows-1252")?;
        assert_eq!(codec.encode("a가b€").as_ref(), b"a?b\x80");
        assert_eq!(codec.encode("plain").as_ref(), b"plain");
        Ok(())
    }

    #[test]
    fn label_lookup_is_case_insensitive() -> Result<()> {
        assert_eq!(TextCodec::from_label("Shift_JIS")?.name(), "Shift_JIS");
        assert_eq!(TextCodec::from_label(" utf-8 ")?, TextCodec::utf8());
        Ok(())
    }

    #[test]
    fn unknown_code_page_is_rejected() {
        let err = TextCodec::from_label("12345").expect_err("not a known code page");
        assert!(matches!(err, SupervisorError::UnknownCodePage(ref label) if label == "12345"));
        assert!(TextCodec::from_label("klingon").is_err());
    }

    #[test]
    fn utf16_labels_are_rejected() {
        // Output would silently become UTF-8, which a child would not expect.
        assert!(TextCodec::from_label("utf-16le").is_err());
    }

    #[test]
    fn system_code_page_is_available() -> Result<()> {
        let codec = TextCodec::from_label("SYSTEM")?;
        assert_eq!(codec, TextCodec::system());
        Ok(())
    }

    #[test]
    fn stateless_decode_is_lossy_on_split_characters() {
        let codec = TextCodec::utf8();
        let bytes = "é".as_bytes();
        assert_eq!(codec.decode(&bytes[..1]), "\u{FFFD}");
    }

    #[test]
    fn stream_decoder_defers_split_characters() {
        let mut decoder = TextCodec::utf8().stream_decoder();
        let bytes = "héllo".as_bytes();
        let first = decoder.decode_chunk(&bytes[..2]);
        let second = decoder.decode_chunk(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn stream_decoder_flushes_dangling_bytes_lossily() {
        let mut decoder = TextCodec::utf8().stream_decoder();
        assert_eq!(decoder.decode_chunk(&[b'a', 0xC3]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.decode_chunk(b"b"), "b");
    }

    #[cfg(not(windows))]
    #[test]
    fn locale_charset_parsing() {
        assert_eq!(charset_from_locale("ko_KR.UTF-8"), Some(UTF_8));
        assert_eq!(charset_from_locale("en_US.utf8"), Some(UTF_8));
        assert_eq!(
            charset_from_locale("ko_KR.EUC-KR@euro").map(Encoding::name),
            Some("EUC-KR")
        );
        assert_eq!(charset_from_locale("C"), None);
    }
}
