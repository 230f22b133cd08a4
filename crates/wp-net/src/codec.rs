//! Body codecs: content-encoding (compression) plus character set.

use brotli::CompressorWriter;
use brotli::Decompressor;
use encoding_rs::Encoding;
use encoding_rs::UTF_8;
use encoding_rs::UTF_16BE;
use encoding_rs::UTF_16LE;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::read::GzDecoder;
use flate2::read::ZlibDecoder;
use flate2::write::GzEncoder;
use flate2::write::ZlibEncoder;
use std::cell::Cell;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use wp_core::ProxyError;
use wp_core::ProxyResult;

const BROTLI_BUFFER_BYTES: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW_BITS: u32 = 22;

/// Declared `Content-Encoding` of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    /// Parses a header value. An empty value means identity.
    pub fn parse(value: &str) -> ProxyResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "br" => Ok(Self::Brotli),
            other => Err(ProxyError::new(
                "net.codec.content_encoding_unsupported",
                format!("unsupported content encoding `{other}`"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
        }
    }
}

/// Character set of a resource.
///
/// Interior mutability lets a transform (or BOM sniffing during decode)
/// update the charset while other readers hold a shared reference to the
/// owning resource context.
#[derive(Debug, Clone, PartialEq)]
pub struct Charset {
    encoding: Cell<&'static Encoding>,
}

impl Default for Charset {
    fn default() -> Self {
        Self::new(UTF_8)
    }
}

impl Charset {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding: Cell::new(encoding),
        }
    }

    /// Looks up a WHATWG encoding label such as `windows-1251` or `latin1`.
    pub fn from_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(Self::new)
    }

    pub fn get(&self) -> &'static Encoding {
        self.encoding.get()
    }

    pub fn set(&self, encoding: &'static Encoding) {
        self.encoding.set(encoding);
    }

    /// Returns false when `label` is not a known encoding; the charset is
    /// left untouched in that case.
    pub fn set_label(&self, label: &str) -> bool {
        match Self::from_label(label) {
            Some(found) => {
                self.set(found.get());
                true
            }
            None => false,
        }
    }

    /// Lower-case canonical name, e.g. `utf-8`.
    pub fn label(&self) -> String {
        self.get().name().to_ascii_lowercase()
    }
}

/// Decode/encode pair applied around a content transform.
pub trait ContentCodec: Send + Sync {
    /// Decompresses `body` and decodes it to text. A byte-order mark
    /// overrides `charset` and the override is written back to it.
    fn decode(
        &self,
        body: &[u8],
        encoding: ContentEncoding,
        charset: &Charset,
    ) -> ProxyResult<String>;

    fn encode(
        &self,
        text: &str,
        encoding: ContentEncoding,
        charset: &Charset,
    ) -> ProxyResult<Vec<u8>>;
}

/// Codec backed by `flate2`, `brotli` and `encoding_rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl ContentCodec for StandardCodec {
    fn decode(
        &self,
        body: &[u8],
        encoding: ContentEncoding,
        charset: &Charset,
    ) -> ProxyResult<String> {
        let raw = decompress(body, encoding)?;
        let declared = charset.get();
        let (text, used, had_errors) = declared.decode(&raw);

        if used != declared {
            log::debug!(
                "byte-order mark overrides charset {} with {}",
                declared.name(),
                used.name()
            );
            charset.set(used);
        }
        if had_errors {
            log::debug!("malformed {} sequences replaced during decode", used.name());
        }

        Ok(text.into_owned())
    }

    fn encode(
        &self,
        text: &str,
        encoding: ContentEncoding,
        charset: &Charset,
    ) -> ProxyResult<Vec<u8>> {
        let target = charset.get();
        if target == UTF_16LE || target == UTF_16BE {
            return compress(&encode_utf16(text, target == UTF_16LE), encoding);
        }

        let (bytes, _, had_unmappable) = target.encode(text);
        if had_unmappable {
            log::warn!(
                "characters outside {} written as numeric character references",
                target.name()
            );
        }
        compress(&bytes, encoding)
    }
}

/// UTF-16 with a leading byte-order mark. `encoding_rs` only encodes to
/// ASCII-compatible encodings, and UTF-16 bodies are only ever picked up
/// through their BOM, so the BOM goes back on.
fn encode_utf16(text: &str, little_endian: bool) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + text.len() * 2);
    for unit in std::iter::once(0xFEFF_u16).chain(text.encode_utf16()) {
        let pair = if little_endian {
            unit.to_le_bytes()
        } else {
            unit.to_be_bytes()
        };
        bytes.extend_from_slice(&pair);
    }
    bytes
}

pub fn decompress(body: &[u8], encoding: ContentEncoding) -> ProxyResult<Vec<u8>> {
    match encoding {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => decode_gzip(body),
        ContentEncoding::Deflate => decode_deflate(body),
        ContentEncoding::Brotli => decode_brotli(body),
    }
}

pub fn compress(body: &[u8], encoding: ContentEncoding) -> ProxyResult<Vec<u8>> {
    match encoding {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(body)
                .map_err(|error| encode_failed("gzip", &error))?;
            encoder
                .finish()
                .map_err(|error| encode_failed("gzip", &error))
        }
        ContentEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(body)
                .map_err(|error| encode_failed("deflate", &error))?;
            encoder
                .finish()
                .map_err(|error| encode_failed("deflate", &error))
        }
        ContentEncoding::Brotli => {
            let mut writer = CompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_BYTES,
                BROTLI_QUALITY,
                BROTLI_WINDOW_BITS,
            );
            writer
                .write_all(body)
                .map_err(|error| encode_failed("brotli", &error))?;
            Ok(writer.into_inner())
        }
    }
}

fn encode_failed(codec: &str, error: &std::io::Error) -> ProxyError {
    ProxyError::new(
        "net.codec.encode_failed",
        format!("{codec} encode failed: {error}"),
    )
}

fn decode_gzip(body: &[u8]) -> ProxyResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(Cursor::new(body));
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|error| {
        ProxyError::new(
            "net.codec.decode_failed",
            format!("gzip decode failed: {error}"),
        )
    })?;
    Ok(decoded)
}

fn decode_deflate(body: &[u8]) -> ProxyResult<Vec<u8>> {
    let mut zlib_decoder = ZlibDecoder::new(Cursor::new(body));
    let mut zlib_decoded = Vec::new();
    if zlib_decoder.read_to_end(&mut zlib_decoded).is_ok() {
        return Ok(zlib_decoded);
    }

    // Some servers send raw deflate without the zlib wrapper.
    let mut raw_decoder = DeflateDecoder::new(Cursor::new(body));
    let mut raw_decoded = Vec::new();
    raw_decoder.read_to_end(&mut raw_decoded).map_err(|error| {
        ProxyError::new(
            "net.codec.decode_failed",
            format!("deflate decode failed: {error}"),
        )
    })?;
    Ok(raw_decoded)
}

fn decode_brotli(body: &[u8]) -> ProxyResult<Vec<u8>> {
    let mut decoder = Decompressor::new(Cursor::new(body), BROTLI_BUFFER_BYTES);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|error| {
        ProxyError::new(
            "net.codec.decode_failed",
            format!("brotli decode failed: {error}"),
        )
    })?;
    Ok(decoded)
}
