//! Integration tests for static repository harvesting
//!
//! These tests use wiremock to serve a static repository document with
//! conditional request support.

use crate::common::{runtime, user_agent};
use chrono::{TimeZone, Utc};
use metaharvest::config::{OaiConfig, PipelineConfig};
use metaharvest::harvester::harvest_source;
use metaharvest::oai::StaticRepositoryHarvester;
use metaharvest::pipeline::XmlFieldExtractor;
use metaharvest::storage::MemoryIndex;
use metaharvest::transport::format_http_date;
use std::sync::Arc;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPOSITORY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Repository xmlns="http://www.openarchives.org/OAI/2.0/static-repository"
            xmlns:oai="http://www.openarchives.org/OAI/2.0/">
  <Identify>
    <oai:repositoryName>Static</oai:repositoryName>
    <oai:granularity>YYYY-MM-DD</oai:granularity>
  </Identify>
  <ListMetadataFormats>
    <oai:metadataFormat><oai:metadataPrefix>oai_dc</oai:metadataPrefix></oai:metadataFormat>
  </ListMetadataFormats>
  <ListRecords metadataPrefix="marc21">
    <oai:record>
      <oai:header><oai:identifier>oai:static:marc</oai:identifier></oai:header>
      <oai:metadata><record/></oai:metadata>
    </oai:record>
  </ListRecords>
  <ListRecords metadataPrefix="oai_dc">
    <oai:record>
      <oai:header><oai:identifier>oai:static:1</oai:identifier><oai:datestamp>2024-02-01</oai:datestamp></oai:header>
      <oai:metadata><dc><title>One</title></dc></oai:metadata>
    </oai:record>
    <oai:record>
      <oai:header><oai:identifier>oai:static:2</oai:identifier><oai:datestamp>2024-02-02</oai:datestamp></oai:header>
      <oai:metadata><dc><title>Two</title></dc></oai:metadata>
    </oai:record>
  </ListRecords>
</Repository>"#;

fn harvester(server: &MockServer) -> StaticRepositoryHarvester {
    let config = OaiConfig::new(format!("{}/repository.xml", server.uri()), "oai_dc");
    StaticRepositoryHarvester::from_config("static", &config, &user_agent())
        .expect("Failed to build harvester")
}

fn run(server: &MockServer, index: &MemoryIndex) -> usize {
    let mut harvester = harvester(server);
    let (harvested, _) = harvest_source(
        &mut harvester,
        &PipelineConfig::default(),
        Box::new(index.clone()),
        Arc::new(XmlFieldExtractor),
    )
    .expect("Harvest failed");
    harvested
}

#[test]
fn test_full_fetch_indexes_matching_listing() {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());
    let last_modified = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();

    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/repository.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/xml")
                    .insert_header("last-modified", format_http_date(last_modified).as_str())
                    .set_body_string(REPOSITORY),
            )
            .expect(1)
            .mount(&server),
    );

    let index = MemoryIndex::with_documents(["oai:static:gone"]);
    assert_eq!(run(&server, &index), 2);

    let state = index.snapshot();
    assert_eq!(
        state.documents.keys().cloned().collect::<Vec<_>>(),
        vec!["oai:static:1", "oai:static:2"]
    );
    assert_eq!(state.documents["oai:static:1"]["dc/title"], vec!["One".to_string()]);
    assert_eq!(state.deletes, vec!["oai:static:gone".to_string()]);
    assert_eq!(state.cursor, Some(last_modified));
}

#[test]
fn test_not_modified_leaves_index_alone() {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());
    let cursor = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();

    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/repository.xml"))
            .and(header_exists("if-modified-since"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server),
    );

    let index = MemoryIndex::with_documents(["oai:static:1", "oai:static:2"]).with_cursor(cursor);
    assert_eq!(run(&server, &index), 0);

    let state = index.snapshot();
    assert!(state.deletes.is_empty());
    assert!(state.upserts.is_empty());
    assert_eq!(state.documents.len(), 2);
    assert_eq!(state.cursor, Some(cursor));
    assert_eq!(state.cursor_writes, 0);
}

#[test]
fn test_first_fetch_is_unconditional() {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());

    rt.block_on(
        Mock::given(method("GET"))
            .and(header_exists("if-modified-since"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server),
    );
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/repository.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REPOSITORY))
            .mount(&server),
    );

    let index = MemoryIndex::new();
    assert_eq!(run(&server, &index), 2);
    // no Last-Modified header, so no cursor either
    assert_eq!(index.snapshot().cursor, None);
    rt.block_on(server.verify());
}
