use crate::config::types::{
    DirectoryConfig, HarvestConfig, OaiConfig, PipelineConfig, SourceConfig, SourceKind,
    UserAgentConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &HarvestConfig) -> Result<(), ConfigError> {
    validate_user_agent_config(&config.user_agent)?;
    validate_storage_config(config)?;
    validate_sources(&config.sources)?;
    Ok(())
}

/// Validates pipeline settings
///
/// Also called by the pipeline itself when it is opened.
pub fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.num_converter_threads < 1 {
        return Err(ConfigError::Validation(format!(
            "num-converter-threads must be >= 1, got {}",
            config.num_converter_threads
        )));
    }

    if config.max_converter_queue < config.num_converter_threads {
        return Err(ConfigError::Validation(format!(
            "max-converter-queue ({}) must be >= num-converter-threads ({})",
            config.max_converter_queue, config.num_converter_threads
        )));
    }

    if config.max_indexer_queue < 1 {
        return Err(ConfigError::Validation(format!(
            "max-indexer-queue must be >= 1, got {}",
            config.max_indexer_queue
        )));
    }

    if config.bulk_size < 1 {
        return Err(ConfigError::Validation(format!(
            "bulk-size must be >= 1, got {}",
            config.bulk_size
        )));
    }

    if config.harvest_message_step < 1 {
        return Err(ConfigError::Validation(format!(
            "harvest-message-step must be >= 1, got {}",
            config.harvest_message_step
        )));
    }

    Ok(())
}

/// Validates OAI-PMH settings
pub fn validate_oai_config(config: &OaiConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("'{}': {}", config.base_url, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "'{}' must use http or https",
            config.base_url
        )));
    }

    if config.metadata_prefix.trim().is_empty() {
        return Err(ConfigError::Validation(
            "metadata-prefix cannot be empty".to_string(),
        ));
    }

    if config.retry_count < 1 {
        return Err(ConfigError::Validation(format!(
            "retry-count must be >= 1, got {}",
            config.retry_count
        )));
    }

    if config.timeout_after_seconds < 1 {
        return Err(ConfigError::Validation(
            "timeout-after-seconds must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.name.is_empty() {
        return Err(ConfigError::Validation(
            "user-agent name cannot be empty".to_string(),
        ));
    }

    if config.name.chars().any(char::is_whitespace) {
        return Err(ConfigError::Validation(format!(
            "user-agent name must not contain whitespace, got '{}'",
            config.name
        )));
    }

    if config.contact.is_empty() {
        return Err(ConfigError::Validation(
            "user-agent contact cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage_config(config: &HarvestConfig) -> Result<(), ConfigError> {
    if config.storage.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_sources(sources: &[SourceConfig]) -> Result<(), ConfigError> {
    if sources.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[source]] must be configured".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for source in sources {
        if source.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "source id cannot be empty".to_string(),
            ));
        }

        if !ids.insert(source.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate source id '{}'",
                source.id
            )));
        }

        validate_pipeline_config(&source.pipeline)
            .map_err(|e| prefix_source(&source.id, e))?;

        match source.kind {
            SourceKind::OaiPmh | SourceKind::OaiStatic => {
                let oai = source.oai.as_ref().ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "source '{}' requires an [source.oai] section",
                        source.id
                    ))
                })?;
                validate_oai_config(oai).map_err(|e| prefix_source(&source.id, e))?;
            }
            SourceKind::Directory => {
                let directory = source.directory.as_ref().ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "source '{}' requires a [source.directory] section",
                        source.id
                    ))
                })?;
                validate_directory_config(directory).map_err(|e| prefix_source(&source.id, e))?;
            }
        }
    }

    Ok(())
}

fn validate_directory_config(config: &DirectoryConfig) -> Result<(), ConfigError> {
    if config.path.is_empty() {
        return Err(ConfigError::Validation(
            "directory path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn prefix_source(source_id: &str, error: ConfigError) -> ConfigError {
    match error {
        ConfigError::Validation(msg) => {
            ConfigError::Validation(format!("source '{}': {}", source_id, msg))
        }
        ConfigError::InvalidUrl(msg) => {
            ConfigError::InvalidUrl(format!("source '{}': {}", source_id, msg))
        }
        other => other,
    }
}
