
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::path::Path;

use super::{
    Config, ConfigError, EmbeddingConfig, EmbeddingProvider, GenerationConfig, RetrievalConfig,
};
use crate::qa::NoContextPolicy;

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 Inbox RAG Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    eprintln!("{}", style("Embedding Configuration").bold().yellow());
    eprintln!("Emails and questions are embedded by this model. Changing it requires a rebuild.");
    eprintln!();

    configure_embedding(&mut config.embedding)?;

    if config.embedding.provider == EmbeddingProvider::Ollama {
        eprintln!();
        eprintln!("{}", style("Testing configuration...").yellow());

        if test_ollama_connection(&config.embedding) {
            eprintln!("{}", style("✓ Ollama connection successful!").green());
        } else {
            eprintln!(
                "{}",
                style("⚠ Warning: Could not connect to Ollama").yellow()
            );
            eprintln!("You can continue, but make sure Ollama is running before indexing.");
        }
    }

    eprintln!();
    eprintln!("{}", style("Retrieval Configuration").bold().yellow());
    configure_retrieval(&mut config.retrieval)?;

    eprintln!();
    eprintln!("{}", style("Answer Generation Configuration").bold().yellow());
    eprintln!("Any OpenAI-compatible chat completions endpoint works here.");
    eprintln!();
    configure_generation(&mut config.generation)?;

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Embedding Settings:").bold().yellow());
    eprintln!(
        "  Provider: {}",
        style(format!("{:?}", config.embedding.provider)).cyan()
    );
    eprintln!("  Model: {}", style(&config.embedding.model).cyan());
    eprintln!("  Dimension: {}", style(config.embedding.dimension).cyan());
    eprintln!("  Batch Size: {}", style(config.embedding.batch_size).cyan());
    match config.embedding_url() {
        Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Retrieval Settings:").bold().yellow());
    eprintln!("  Top K: {}", style(config.retrieval.top_k).cyan());
    eprintln!(
        "  Similarity Floor: {}",
        style(config.retrieval.similarity_floor).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Generation Settings:").bold().yellow());
    eprintln!("  Endpoint: {}", style(&config.generation.endpoint).cyan());
    eprintln!("  Model: {}", style(&config.generation.model).cyan());
    eprintln!(
        "  API Key Variable: {} ({})",
        style(&config.generation.api_key_env).cyan(),
        if std::env::var_os(&config.generation.api_key_env).is_some() {
            style("set").green()
        } else {
            style("not set").red()
        }
    );
    eprintln!(
        "  Prompt Budget: {} tokens",
        style(config.generation.prompt_token_budget).cyan()
    );
    eprintln!(
        "  Retries: {} (backoff {}ms)",
        style(config.generation.retry_attempts).cyan(),
        style(config.generation.retry_backoff_ms).cyan()
    );
    eprintln!(
        "  No-context Policy: {}",
        style(config.generation.no_context_policy).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
    eprintln!("Index file: {}", style(config.index_path().display()).dim());

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No existing configuration found. Using defaults.").yellow()
            );
            Ok(Config {
                base_dir: config_dir.to_path_buf(),
                ..Config::default()
            })
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn configure_embedding(embedding: &mut EmbeddingConfig) -> Result<()> {
    let providers = &["ollama", "hashing (offline)"];
    let default_provider = match embedding.provider {
        EmbeddingProvider::Ollama => 0,
        EmbeddingProvider::Hashing => 1,
    };
    let provider_index = Select::new()
        .with_prompt("Embedding provider")
        .default(default_provider)
        .items(providers)
        .interact()?;
    embedding.provider = if provider_index == 0 {
        EmbeddingProvider::Ollama
    } else {
        EmbeddingProvider::Hashing
    };

    if embedding.provider == EmbeddingProvider::Ollama {
        let protocols = &["http", "https"];
        let default_index = protocols
            .iter()
            .position(|&p| p == embedding.protocol)
            .unwrap_or(0);

        let protocol_index = Select::new()
            .with_prompt("Ollama protocol")
            .default(default_index)
            .items(protocols)
            .interact()?;

        let protocol = protocols[protocol_index].to_string();

        let host: String = Input::new()
            .with_prompt("Ollama host")
            .default(embedding.host.clone())
            .validate_with(|input: &String| -> Result<(), ConfigError> {
                let temp_config = EmbeddingConfig {
                    protocol: protocol.clone(),
                    host: input.clone(),
                    ..embedding.clone()
                };
                temp_config.base_url()?;
                Ok(())
            })
            .interact_text()?;

        let port: u16 = Input::new()
            .with_prompt("Ollama port")
            .default(embedding.port)
            .validate_with(|input: &u16| -> Result<(), &str> {
                if *input == 0 {
                    Err("Port must be greater than 0")
                } else {
                    Ok(())
                }
            })
            .interact_text()?;

        let model: String = Input::new()
            .with_prompt("Embedding model")
            .default(embedding.model.clone())
            .validate_with(|input: &String| -> Result<(), &str> {
                if input.trim().is_empty() {
                    Err("Model name cannot be empty")
                } else {
                    Ok(())
                }
            })
            .interact_text()?;

        embedding.set_protocol(protocol)?;
        embedding.set_host(host)?;
        embedding.set_port(port)?;
        embedding.set_model(model)?;
    }

    let dimension: u32 = Input::new()
        .with_prompt("Embedding dimension")
        .default(embedding.dimension)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if (8..=4096).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 8 and 4096")
            }
        })
        .interact_text()?;

    let batch_size: u32 = Input::new()
        .with_prompt("Batch size for embedding generation")
        .default(embedding.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 1000 {
                Err("Batch size must be 1000 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    embedding.set_dimension(dimension)?;
    embedding.set_batch_size(batch_size)?;

    Ok(())
}

fn configure_retrieval(retrieval: &mut RetrievalConfig) -> Result<()> {
    let top_k: usize = Input::new()
        .with_prompt("Emails retrieved per question (top K)")
        .default(retrieval.top_k)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=100).contains(input) {
                Ok(())
            } else {
                Err("Top K must be between 1 and 100")
            }
        })
        .interact_text()?;

    let floor: f32 = Input::new()
        .with_prompt("Minimum similarity for an email to count as relevant")
        .default(retrieval.similarity_floor)
        .validate_with(|input: &f32| -> Result<(), &str> {
            if (-1.0..=1.0).contains(input) {
                Ok(())
            } else {
                Err("Similarity floor must be between -1.0 and 1.0")
            }
        })
        .interact_text()?;

    retrieval.set_top_k(top_k)?;
    retrieval.set_similarity_floor(floor)?;
    Ok(())
}

fn configure_generation(generation: &mut GenerationConfig) -> Result<()> {
    let endpoint: String = Input::new()
        .with_prompt("Chat completions endpoint")
        .default(generation.endpoint.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = GenerationConfig {
                endpoint: input.clone(),
                ..generation.clone()
            };
            temp_config.endpoint_url()?;
            Ok(())
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Completion model")
        .default(generation.model.clone())
        .interact_text()?;

    let api_key_env: String = Input::new()
        .with_prompt("Environment variable holding the API key")
        .default(generation.api_key_env.clone())
        .interact_text()?;

    let policies = &[
        "refuse when no relevant emails are found",
        "answer from general knowledge, marked as unsupported",
    ];
    let default_policy = match generation.no_context_policy {
        NoContextPolicy::Refuse => 0,
        NoContextPolicy::GeneralKnowledge => 1,
    };
    let policy_index = Select::new()
        .with_prompt("When no email is relevant")
        .default(default_policy)
        .items(policies)
        .interact()?;

    generation.set_endpoint(endpoint)?;
    generation.set_model(model)?;
    generation.api_key_env = api_key_env;
    generation.no_context_policy = if policy_index == 0 {
        NoContextPolicy::Refuse
    } else {
        NoContextPolicy::GeneralKnowledge
    };
    generation.validate()?;

    Ok(())
}

fn test_ollama_connection(embedding: &EmbeddingConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        embedding.protocol, embedding.host, embedding.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}
