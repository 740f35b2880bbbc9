//! Streaming OAI-PMH response parser
//!
//! A [`PageParser`] reads one response document from start to end and hands
//! every complete record to a callback as soon as its closing tag is read.
//! Parsers are consumed by [`PageParser::parse`]; a retried request always
//! gets a new one.
//!
//! Captured metadata is always UTF-8 and carries the namespace declarations
//! it inherited from the envelope, so it can be read as a document on its own.

use crate::oai::charset::HintedSource;
use crate::oai::dates::{parse_datestamp, Granularity};
use crate::oai::OaiError;
use chrono::{DateTime, Utc};
use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesCData, BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::name::{Namespace, PrefixDeclaration, ResolveResult};
use quick_xml::{NsReader, Writer};
use std::borrow::Cow;
use std::io::BufRead;
use tracing::warn;

/// OAI-PMH 2.0 namespace
pub const OAI_NAMESPACE: &[u8] = b"http://www.openarchives.org/OAI/2.0/";

/// OAI static repository namespace
pub const STATIC_REPOSITORY_NAMESPACE: &[u8] =
    b"http://www.openarchives.org/OAI/2.0/static-repository";

const NO_RECORDS_MATCH: &str = "noRecordsMatch";

/// Header of one harvested record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub identifier: String,
    pub datestamp: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub sets: Vec<String>,
}

/// One `record` element: header plus the raw XML inside `metadata`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiRecord {
    pub header: RecordHeader,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionToken {
    pub token: String,
    pub expiration: Option<DateTime<Utc>>,
    pub cursor: Option<u64>,
    pub complete_list_size: Option<u64>,
}

/// Everything but the records of one response page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub response_date: Option<DateTime<Utc>>,
    pub granularity: Option<Granularity>,
    /// Present only when another page follows
    pub resumption_token: Option<ResumptionToken>,
    pub records: usize,
    pub no_records_match: bool,
}

/// Which `ListRecords` elements contribute records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingScope {
    /// A regular OAI-PMH response
    Response,
    /// A static repository document; only the listing for this prefix counts
    StaticRepository { metadata_prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ns {
    Oai,
    Static,
    Other,
}

impl Ns {
    fn of(resolved: &ResolveResult<'_>) -> Self {
        match resolved {
            ResolveResult::Bound(Namespace(ns)) if *ns == OAI_NAMESPACE => Ns::Oai,
            ResolveResult::Bound(Namespace(ns)) if *ns == STATIC_REPOSITORY_NAMESPACE => {
                Ns::Static
            }
            _ => Ns::Other,
        }
    }
}

/// UTF-8 copy of the children of a `metadata` element
struct Capture {
    writer: Writer<Vec<u8>>,
    depth: usize,
}

/// `xmlns` attribute name and namespace URI
type Binding = (String, String);

impl Capture {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            depth: 0,
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<(), OaiError> {
        self.writer
            .write_event(event)
            .map_err(|e| OaiError::InvalidResponse(format!("cannot copy metadata: {}", e)))
    }

    /// Re-encodes a start tag, declaring `inherited` bindings it does not
    /// declare itself
    fn copy_start(
        element: &BytesStart<'_>,
        decoder: Decoder,
        inherited: &[Binding],
    ) -> Result<BytesStart<'static>, OaiError> {
        let name_len = decode(decoder, element.name().as_ref())?.len();
        let mut copy = BytesStart::from_content(decode(decoder, element)?.into_owned(), name_len);

        if !inherited.is_empty() {
            let mut declared = Vec::new();
            for attr in element.attributes() {
                let attr = attr.map_err(quick_xml::Error::from)?;
                if attr.key.as_namespace_binding().is_some() {
                    declared.push(decode(decoder, attr.key.as_ref())?.into_owned());
                }
            }
            for (name, uri) in inherited {
                if !declared.contains(name) {
                    copy.push_attribute((name.as_str(), uri.as_str()));
                }
            }
        }
        Ok(copy)
    }

    fn finish(self) -> Result<String, OaiError> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| OaiError::InvalidResponse(format!("metadata is not UTF-8: {}", e)))
    }
}

fn decode<'b>(decoder: Decoder, bytes: &'b [u8]) -> Result<Cow<'b, str>, OaiError> {
    decoder
        .decode(bytes)
        .map_err(|e| OaiError::Xml(quick_xml::Error::from(e)))
}

/// Namespace bindings in scope at the reader's position, as attributes
fn in_scope_bindings<R>(reader: &NsReader<R>) -> Result<Vec<Binding>, OaiError> {
    let decoder = reader.decoder();
    let mut bindings = Vec::new();
    for (prefix, Namespace(uri)) in reader.prefixes() {
        let name = match prefix {
            PrefixDeclaration::Default => "xmlns".to_string(),
            PrefixDeclaration::Named(b"xml") | PrefixDeclaration::Named(b"xmlns") => continue,
            PrefixDeclaration::Named(prefix) => format!("xmlns:{}", decode(decoder, prefix)?),
        };
        bindings.push((name, decode(decoder, uri)?.into_owned()));
    }
    Ok(bindings)
}

#[derive(Default)]
struct ParseState {
    summary: PageSummary,
    text: String,
    in_listing: bool,
    in_header: bool,
    record: Option<(RecordHeader, Option<String>)>,
    capture: Option<Capture>,
    error_code: Option<String>,
    token: Option<ResumptionToken>,
}

/// Single-use parser over one response body
pub struct PageParser<R: BufRead> {
    reader: NsReader<HintedSource<R>>,
    scope: ListingScope,
}

impl<R: BufRead> PageParser<R> {
    /// Prepares a parser over `source`
    ///
    /// `charset` is the `Content-Type` charset of the response, if any. It is
    /// used only when the document has neither a byte order mark nor an
    /// encoding in its XML declaration.
    pub fn new(source: R, scope: ListingScope, charset: Option<&str>) -> Result<Self, OaiError> {
        let mut reader = NsReader::from_reader(HintedSource::new(source, charset)?);
        reader.config_mut().trim_text(true);
        reader.config_mut().expand_empty_elements = true;
        Ok(Self { reader, scope })
    }

    /// Reads the whole document, calling `on_record` for every record
    ///
    /// An OAI-PMH `error` element other than `noRecordsMatch` stops parsing
    /// with [`OaiError::Protocol`].
    pub fn parse<F>(mut self, mut on_record: F) -> Result<PageSummary, OaiError>
    where
        F: FnMut(OaiRecord) -> Result<(), OaiError>,
    {
        let mut state = ParseState::default();
        let mut buf = Vec::new();

        loop {
            let done = {
                let (resolved, event) = self.reader.read_resolved_event_into(&mut buf)?;
                let ns = Ns::of(&resolved);
                let inherited = if state.at_capture_root(&event) {
                    in_scope_bindings(&self.reader)?
                } else {
                    Vec::new()
                };
                let decoder = self.reader.decoder();
                state.handle(&self.scope, ns, decoder, &inherited, event, &mut on_record)?
            };
            buf.clear();
            if done {
                break;
            }
        }

        Ok(state.summary)
    }
}

impl ParseState {
    /// True if `event` opens a top-level element inside `metadata`
    fn at_capture_root(&self, event: &Event<'_>) -> bool {
        matches!(event, Event::Start(_) | Event::Empty(_))
            && self.capture.as_ref().is_some_and(|capture| capture.depth == 0)
    }

    /// Processes one event; true once the document has ended
    fn handle<F>(
        &mut self,
        scope: &ListingScope,
        ns: Ns,
        decoder: Decoder,
        inherited: &[Binding],
        event: Event<'_>,
        on_record: &mut F,
    ) -> Result<bool, OaiError>
    where
        F: FnMut(OaiRecord) -> Result<(), OaiError>,
    {
        if self.capture.is_some() {
            return self.handle_captured(decoder, inherited, event);
        }

        match event {
            Event::Start(element) => {
                self.text.clear();
                self.start_element(scope, ns, decoder, &element)?;
            }
            Event::Text(text) => self.text.push_str(&text.unescape()?),
            Event::CData(data) => self.text.push_str(&decode(decoder, &data)?),
            Event::End(element) => {
                self.end_element(ns, element.local_name().as_ref(), on_record)?;
                self.text.clear();
            }
            Event::Eof if self.record.is_some() => {
                return Err(OaiError::Truncated("document ended inside <record>"))
            }
            Event::Eof if self.in_listing => {
                return Err(OaiError::Truncated("document ended inside <ListRecords>"))
            }
            Event::Eof => return Ok(true),
            _ => {}
        }
        Ok(false)
    }

    fn handle_captured(
        &mut self,
        decoder: Decoder,
        inherited: &[Binding],
        event: Event<'_>,
    ) -> Result<bool, OaiError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(false);
        };

        match event {
            Event::Start(element) => {
                let copy = Capture::copy_start(&element, decoder, inherited)?;
                capture.depth += 1;
                capture.write(Event::Start(copy))?;
            }
            Event::Empty(element) => {
                let copy = Capture::copy_start(&element, decoder, inherited)?;
                capture.write(Event::Empty(copy))?;
            }
            Event::End(_) if capture.depth == 0 => {
                if let Some(capture) = self.capture.take() {
                    let metadata = capture.finish()?;
                    if let Some((_, slot)) = self.record.as_mut() {
                        *slot = Some(metadata);
                    }
                }
            }
            Event::End(element) => {
                capture.depth -= 1;
                let qname = element.name();
                let name = decode(decoder, qname.as_ref())?;
                capture.write(Event::End(BytesEnd::new(name)))?;
            }
            Event::Text(text) => {
                capture.write(Event::Text(BytesText::from_escaped(decode(decoder, &text)?)))?;
            }
            Event::CData(data) => {
                capture.write(Event::CData(BytesCData::new(decode(decoder, &data)?)))?;
            }
            Event::Comment(text) => {
                capture.write(Event::Comment(BytesText::from_escaped(decode(decoder, &text)?)))?;
            }
            Event::PI(pi) => {
                capture.write(Event::PI(BytesPI::new(decode(decoder, &pi)?)))?;
            }
            Event::Eof => return Err(OaiError::Truncated("document ended inside <metadata>")),
            _ => {}
        }
        Ok(false)
    }

    fn start_element(
        &mut self,
        scope: &ListingScope,
        ns: Ns,
        decoder: Decoder,
        element: &BytesStart<'_>,
    ) -> Result<(), OaiError> {
        match (ns, element.local_name().as_ref()) {
            (Ns::Oai, b"ListRecords") if *scope == ListingScope::Response => {
                self.in_listing = true;
            }
            (Ns::Static, b"ListRecords") => {
                if let ListingScope::StaticRepository { metadata_prefix } = scope {
                    let prefix = attribute(element, b"metadataPrefix", decoder)?;
                    self.in_listing = prefix.as_deref() == Some(metadata_prefix.as_str());
                }
            }
            (Ns::Oai, b"record") if self.in_listing => {
                self.record = Some((RecordHeader::default(), None));
            }
            (Ns::Oai, b"header") => {
                if let Some((header, _)) = self.record.as_mut() {
                    self.in_header = true;
                    header.deleted = attribute(element, b"status", decoder)?.as_deref() == Some("deleted");
                }
            }
            (Ns::Oai, b"metadata") if self.record.is_some() && !self.in_header => {
                self.capture = Some(Capture::new());
            }
            (Ns::Oai, b"error") => {
                self.error_code = Some(attribute(element, b"code", decoder)?.unwrap_or_default());
            }
            (Ns::Oai, b"resumptionToken") if self.in_listing => {
                self.token = Some(ResumptionToken {
                    token: String::new(),
                    expiration: attribute(element, b"expirationDate", decoder)?
                        .as_deref()
                        .and_then(parse_datestamp),
                    cursor: attribute(element, b"cursor", decoder)?.and_then(|v| v.trim().parse().ok()),
                    complete_list_size: attribute(element, b"completeListSize", decoder)?
                        .and_then(|v| v.trim().parse().ok()),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn end_element<F>(&mut self, ns: Ns, local: &[u8], on_record: &mut F) -> Result<(), OaiError>
    where
        F: FnMut(OaiRecord) -> Result<(), OaiError>,
    {
        let text = self.text.trim();
        match (ns, local) {
            (Ns::Oai, b"responseDate") => self.summary.response_date = parse_datestamp(text),
            (Ns::Oai, b"granularity") => self.summary.granularity = Granularity::parse(text),
            (Ns::Oai, b"identifier") if self.in_header => {
                if let Some((header, _)) = self.record.as_mut() {
                    header.identifier = text.to_string();
                }
            }
            (Ns::Oai, b"datestamp") if self.in_header => {
                if let Some((header, _)) = self.record.as_mut() {
                    header.datestamp = parse_datestamp(text);
                }
            }
            (Ns::Oai, b"setSpec") if self.in_header => {
                if let Some((header, _)) = self.record.as_mut() {
                    header.sets.push(text.to_string());
                }
            }
            (Ns::Oai, b"header") => self.in_header = false,
            (Ns::Oai, b"record") => {
                if let Some((header, metadata)) = self.record.take() {
                    if header.identifier.is_empty() {
                        warn!("Skipping record without identifier");
                    } else {
                        self.summary.records += 1;
                        on_record(OaiRecord { header, metadata })?;
                    }
                }
            }
            (Ns::Oai, b"error") => {
                let code = self.error_code.take().unwrap_or_default();
                if code == NO_RECORDS_MATCH {
                    self.summary.no_records_match = true;
                } else {
                    return Err(OaiError::Protocol {
                        code,
                        message: text.to_string(),
                    });
                }
            }
            (Ns::Oai, b"resumptionToken") => {
                if let Some(mut token) = self.token.take() {
                    if !text.is_empty() {
                        token.token = text.to_string();
                        self.summary.resumption_token = Some(token);
                    }
                }
            }
            (Ns::Oai, b"ListRecords") | (Ns::Static, b"ListRecords") => self.in_listing = false,
            _ => {}
        }
        Ok(())
    }
}

fn attribute(
    element: &BytesStart<'_>,
    name: &[u8],
    decoder: Decoder,
) -> Result<Option<String>, OaiError> {
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.decode_and_unescape_value(decoder)?.into_owned()));
        }
    }
    Ok(None)
}

/// Parses a regular OAI-PMH response
pub fn parse_response<R, F>(
    source: R,
    charset: Option<&str>,
    on_record: F,
) -> Result<PageSummary, OaiError>
where
    R: BufRead,
    F: FnMut(OaiRecord) -> Result<(), OaiError>,
{
    PageParser::new(source, ListingScope::Response, charset)?.parse(on_record)
}

/// Parses a static repository document, keeping records for `metadata_prefix`
pub fn parse_static_repository<R, F>(
    source: R,
    charset: Option<&str>,
    metadata_prefix: &str,
    on_record: F,
) -> Result<PageSummary, OaiError>
where
    R: BufRead,
    F: FnMut(OaiRecord) -> Result<(), OaiError>,
{
    let scope = ListingScope::StaticRepository {
        metadata_prefix: metadata_prefix.to_string(),
    };
    PageParser::new(source, scope, charset)?.parse(on_record)
}
