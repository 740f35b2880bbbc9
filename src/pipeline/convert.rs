//! Convert stage
//!
//! Turns a raw [`DocumentRecord`] into the field set stored in the index.
//! Transformation and validation are delegated to a [`DocumentConverter`];
//! the crate ships [`XmlFieldExtractor`], which flattens the payload's
//! elements and attributes into path-named fields.

use crate::document::{DocumentRecord, FieldSet};
use quick_xml::encoding::Decoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// What to do with a document whose conversion failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ErrorAction {
    /// Abort the run
    #[serde(rename = "stop", alias = "STOP")]
    Stop,
    /// Log and drop the document
    #[default]
    #[serde(
        rename = "ignore",
        alias = "IGNORE",
        alias = "IGNOREDOCUMENT",
        alias = "ignoredocument"
    )]
    Ignore,
    /// Remove the document from the index
    #[serde(
        rename = "delete",
        alias = "DELETE",
        alias = "DELETEDOCUMENT",
        alias = "deletedocument"
    )]
    Delete,
}

/// Per-document conversion failures
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Document has no payload")]
    MissingPayload,

    #[error("Malformed XML: {0}")]
    Malformed(String),

    #[error("Document contains no elements")]
    Empty,

    #[error("Document rejected: {0}")]
    Rejected(String),
}

/// Values visible to a converter while it handles one source's documents
///
/// Passed explicitly into every [`DocumentConverter::convert`] call.
#[derive(Debug, Clone, Default)]
pub struct ConvertContext {
    source_id: String,
    variables: BTreeMap<String, String>,
}

impl ConvertContext {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// Transforms and validates one record into indexable fields
///
/// Called concurrently from every converter thread. Never called for
/// deleted records.
pub trait DocumentConverter: Send + Sync {
    fn convert(
        &self,
        record: &DocumentRecord,
        context: &ConvertContext,
    ) -> Result<FieldSet, ConvertError>;
}

impl<F> DocumentConverter for F
where
    F: Fn(&DocumentRecord, &ConvertContext) -> Result<FieldSet, ConvertError> + Send + Sync,
{
    fn convert(
        &self,
        record: &DocumentRecord,
        context: &ConvertContext,
    ) -> Result<FieldSet, ConvertError> {
        self(record, context)
    }
}

/// Default converter: one field per element path
///
/// `<dc><title>X</title></dc>` yields `dc/title = [X]`; attributes are stored
/// as `path@name`. Namespace prefixes are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlFieldExtractor;

impl DocumentConverter for XmlFieldExtractor {
    fn convert(
        &self,
        record: &DocumentRecord,
        _context: &ConvertContext,
    ) -> Result<FieldSet, ConvertError> {
        let payload = record.payload().ok_or(ConvertError::MissingPayload)?;
        extract_fields(payload)
    }
}

fn extract_fields(xml: &str) -> Result<FieldSet, ConvertError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = FieldSet::new();
    let mut path: Vec<String> = Vec::new();
    let mut saw_element = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ConvertError::Malformed(e.to_string()))?;

        match event {
            Event::Start(e) => {
                saw_element = true;
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                collect_attributes(&e, reader.decoder(), &path, &mut fields)?;
            }
            Event::Empty(e) => {
                saw_element = true;
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                collect_attributes(&e, reader.decoder(), &path, &mut fields)?;
                path.pop();
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|e| ConvertError::Malformed(e.to_string()))?;
                push_text(&mut fields, &path, &value);
            }
            Event::CData(data) => {
                let value = data
                    .decode()
                    .map_err(|e| ConvertError::Malformed(e.to_string()))?;
                push_text(&mut fields, &path, value.trim());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !path.is_empty() {
        return Err(ConvertError::Malformed(format!(
            "unclosed element <{}>",
            path.join("/")
        )));
    }
    if !saw_element {
        return Err(ConvertError::Empty);
    }

    Ok(fields)
}

fn collect_attributes(
    element: &quick_xml::events::BytesStart<'_>,
    decoder: Decoder,
    path: &[String],
    fields: &mut FieldSet,
) -> Result<(), ConvertError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ConvertError::Malformed(e.to_string()))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let name = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| ConvertError::Malformed(e.to_string()))?;
        fields
            .entry(format!("{}@{}", path.join("/"), name))
            .or_default()
            .push(value.into_owned());
    }
    Ok(())
}

fn push_text(fields: &mut FieldSet, path: &[String], value: &str) {
    if value.is_empty() || path.is_empty() {
        return;
    }
    fields
        .entry(path.join("/"))
        .or_default()
        .push(value.to_string());
}
