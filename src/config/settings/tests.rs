use super::*;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.embedding.provider, EmbeddingProvider::Ollama);
    assert_eq!(config.embedding.protocol, "http");
    assert_eq!(config.embedding.host, "localhost");
    assert_eq!(config.embedding.port, 11434);
    assert_eq!(config.embedding.model, "all-minilm:latest");
    assert_eq!(config.embedding.batch_size, 32);
    assert_eq!(config.retrieval.top_k, 8);
    assert_eq!(config.generation.max_tokens, 800);
    assert_eq!(config.generation.no_context_policy, NoContextPolicy::Refuse);
}

#[test]
fn config_validation() {
    let config = Config::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.embedding.protocol = "ftp".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.port = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.model = String::new();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.batch_size = 1001;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.retrieval.top_k = 0;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidTopK(0))
    ));

    let mut invalid_config = config.clone();
    invalid_config.retrieval.similarity_floor = 1.5;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.generation.prompt_token_budget = 10;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidPromptBudget(10))
    ));

    let mut invalid_config = config.clone();
    invalid_config.generation.endpoint = "not a url".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config;
    invalid_config.indexing.workers = 0;
    assert!(invalid_config.validate().is_err());
}

#[test]
fn embedding_url_generation() {
    let config = Config::default();
    let url = config
        .embedding_url()
        .expect("should generate embedding url successfully");
    assert_eq!(url.as_str(), "http://localhost:11434/");
}

#[test]
fn toml_serialization() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config.embedding, parsed_config.embedding);
    assert_eq!(config.retrieval, parsed_config.retrieval);
    assert_eq!(config.generation, parsed_config.generation);
    assert_eq!(config.indexing, parsed_config.indexing);
}

#[test]
fn partial_toml_uses_defaults() {
    let toml_str = r#"
        [embedding]
        provider = "hashing"
        dimension = 256

        [generation]
        no_context_policy = "general_knowledge"
    "#;

    let config: Config = toml::from_str(toml_str).expect("should parse partial toml");
    assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
    assert_eq!(config.embedding.dimension, 256);
    assert_eq!(config.embedding.host, "localhost");
    assert_eq!(config.retrieval, RetrievalConfig::default());
    assert_eq!(
        config.generation.no_context_policy,
        NoContextPolicy::GeneralKnowledge
    );
    assert_eq!(config.generation.model, "llama3-70b-8192");
}

#[test]
fn setter_validation() {
    let mut config = EmbeddingConfig::default();

    assert!(config.set_protocol("https".to_string()).is_ok());
    assert!(config.set_host("example.com".to_string()).is_ok());
    assert!(config.set_port(8080).is_ok());
    assert!(config.set_model("new-model".to_string()).is_ok());
    assert!(config.set_batch_size(128).is_ok());
    assert!(config.set_dimension(768).is_ok());

    assert!(config.set_protocol("ftp".to_string()).is_err());
    assert!(config.set_port(0).is_err());
    assert!(config.set_model(String::new()).is_err());
    assert!(config.set_batch_size(0).is_err());
    assert!(config.set_batch_size(1001).is_err());
    assert!(config.set_dimension(4).is_err());

    assert_eq!(config.protocol, "https");
    assert_eq!(config.batch_size, 128);

    let mut retrieval = RetrievalConfig::default();
    assert!(retrieval.set_top_k(20).is_ok());
    assert!(retrieval.set_top_k(101).is_err());
    assert!(retrieval.set_similarity_floor(0.5).is_ok());
    assert!(retrieval.set_similarity_floor(-2.0).is_err());
    assert_eq!(retrieval.top_k, 20);

    let mut generation = GenerationConfig::default();
    assert!(
        generation
            .set_endpoint("http://localhost:11434/v1/chat/completions".to_string())
            .is_ok()
    );
    assert!(generation.set_endpoint("ftp://example.com".to_string()).is_err());
    assert!(generation.set_retry_attempts(0).is_err());
    assert!(generation.set_prompt_token_budget(4096).is_ok());
}

#[test]
fn load_missing_config_returns_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let config = Config::load(temp_dir.path()).expect("should load default config");
    assert_eq!(config.get_base_dir(), temp_dir.path());
    assert_eq!(config.embedding, EmbeddingConfig::default());
    assert_eq!(config.index_path(), temp_dir.path().join("index.db"));
}

#[test]
fn save_then_load() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.retrieval.top_k = 5;
    config.generation.no_context_policy = NoContextPolicy::GeneralKnowledge;
    config.save().expect("should save config");

    let loaded = Config::load(temp_dir.path()).expect("should load saved config");
    assert_eq!(config, loaded);
}

#[test]
fn load_rejects_invalid_values() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    fs::write(
        temp_dir.path().join("config.toml"),
        "[retrieval]\ntop_k = 0\n",
    )
    .expect("should write config file");

    assert!(Config::load(temp_dir.path()).is_err());
}

#[test]
fn engine_options_reflect_config() {
    let mut config = Config::default();
    config.embedding.provider = EmbeddingProvider::Hashing;
    config.generation.retry_backoff_ms = 250;

    let options = config.engine_options();
    assert_eq!(options.model_id, "hashing-v1");
    assert_eq!(options.top_k, 8);
    assert!((options.similarity_floor - 0.3).abs() < f32::EPSILON);
    assert_eq!(options.prompt_token_budget, 3000);
    assert_eq!(options.retry_attempts, 3);
    assert_eq!(options.retry_backoff, Duration::from_millis(250));

    config.embedding.provider = EmbeddingProvider::Ollama;
    assert_eq!(config.engine_options().model_id, "ollama:all-minilm:latest");
}
