//! Body decoding for the `Content-Type` charset
//!
//! quick-xml decodes documents that carry a byte order mark or an encoding in
//! their XML declaration. A body that only has a charset in its HTTP header is
//! transcoded to UTF-8 here before the parser sees it.

use encoding_rs::{DecoderResult, Encoding, UTF_8};
use std::io::{self, BufRead, Read};
use tracing::debug;

const CHUNK_SIZE: usize = 8 * 1024;

/// A response body, transcoded to UTF-8 when needed
pub enum HintedSource<R> {
    Plain(R),
    Transcoded(Transcoder<R>),
}

impl<R: BufRead> HintedSource<R> {
    /// Wraps `source`, transcoding it from `charset` unless the document
    /// identifies its own encoding
    ///
    /// Unknown labels are ignored and the body is read as declared or as UTF-8.
    pub fn new(mut source: R, charset: Option<&str>) -> io::Result<Self> {
        let Some(label) = charset else {
            return Ok(HintedSource::Plain(source));
        };
        let Some(encoding) = Encoding::for_label(label.trim().as_bytes()) else {
            debug!("Ignoring unknown charset {:?}", label);
            return Ok(HintedSource::Plain(source));
        };

        if encoding == UTF_8 || self_describing(source.fill_buf()?) {
            return Ok(HintedSource::Plain(source));
        }

        debug!("Transcoding response body from {}", encoding.name());
        Ok(HintedSource::Transcoded(Transcoder::new(source, encoding)))
    }

    pub fn is_transcoded(&self) -> bool {
        matches!(self, HintedSource::Transcoded(_))
    }
}

/// True if the document starts with a byte order mark or declares an encoding
fn self_describing(head: &[u8]) -> bool {
    if let Some((_, bom_len)) = quick_xml::encoding::detect_encoding(head) {
        if bom_len > 0 {
            return true;
        }
    }
    if !head.starts_with(b"<?xml") {
        return false;
    }
    let declaration = match head.windows(2).position(|pair| pair == b"?>") {
        Some(end) => &head[..end],
        None => head,
    };
    declaration
        .windows(b"encoding".len())
        .any(|window| window == b"encoding")
}

impl<R: BufRead> Read for HintedSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            HintedSource::Plain(inner) => inner.read(buf),
            HintedSource::Transcoded(inner) => inner.read(buf),
        }
    }
}

impl<R: BufRead> BufRead for HintedSource<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            HintedSource::Plain(inner) => inner.fill_buf(),
            HintedSource::Transcoded(inner) => inner.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            HintedSource::Plain(inner) => inner.consume(amt),
            HintedSource::Transcoded(inner) => inner.consume(amt),
        }
    }
}

/// Streaming decoder from a single-encoding byte stream to UTF-8
pub struct Transcoder<R> {
    inner: R,
    encoding: &'static Encoding,
    decoder: encoding_rs::Decoder,
    out: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: BufRead> Transcoder<R> {
    pub fn new(inner: R, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            encoding,
            decoder: encoding.new_decoder_without_bom_handling(),
            out: Vec::with_capacity(CHUNK_SIZE),
            pos: 0,
            finished: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        self.out.clear();
        self.pos = 0;

        while self.out.is_empty() && !self.finished {
            let input = self.inner.fill_buf()?;
            let last = input.is_empty();

            self.out.resize(CHUNK_SIZE, 0);
            let (result, read, written) =
                self.decoder
                    .decode_to_utf8_without_replacement(input, &mut self.out, last);
            self.out.truncate(written);
            self.inner.consume(read);

            match result {
                DecoderResult::Malformed(_, _) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("body is not valid {}", self.encoding.name()),
                    ))
                }
                DecoderResult::InputEmpty if last => self.finished = true,
                DecoderResult::InputEmpty | DecoderResult::OutputFull => {}
            }
        }
        Ok(())
    }
}

impl<R: BufRead> Read for Transcoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for Transcoder<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.out.len() {
            self.refill()?;
        }
        Ok(&self.out[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.out.len());
    }
}
