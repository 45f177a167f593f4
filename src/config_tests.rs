use super::*;

fn small_config() -> PipelineConfig {
    PipelineConfig {
        sources: vec!["alpha".to_string(), "beta".to_string()],
        partitions: vec![PartitionSpec::new("train", 20), PartitionSpec::new("test", 8)],
        treatments: vec!["a".to_string(), "b".to_string()],
        engines: vec!["org/model-1".to_string(), "model-2".to_string()],
        ..default_config()
    }
}

#[test]
fn default_config_validates() {
    validate_config(&default_config()).expect("defaults are valid");
}

#[test]
fn partial_config_file_keeps_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, br#"{"sources": ["only"], "seed": 7}"#).expect("write config");
    let config = load_config(&path).expect("load config");
    assert_eq!(config.sources, vec!["only".to_string()]);
    assert_eq!(config.seed, 7);
    assert_eq!(config.treatments, default_config().treatments);
    assert_eq!(config.retry, RetryConfig::default());
}

#[test]
fn unknown_config_fields_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, br#"{"sourcez": ["typo"]}"#).expect("write config");
    assert!(load_config(&path).is_err());
}

#[test]
fn partition_spec_parses_name_and_size() {
    let spec: PartitionSpec = "validation=600".parse().expect("parse spec");
    assert_eq!(spec, PartitionSpec::new("validation", 600));
    assert!("validation".parse::<PartitionSpec>().is_err());
    assert!("train=lots".parse::<PartitionSpec>().is_err());
}

#[test]
fn overrides_replace_lists_and_keep_unset_values() {
    let mut config = small_config();
    config.apply_overrides(ConfigOverrides {
        sources: vec!["gamma".to_string()],
        seed: Some(9),
        corpus: Some(PathBuf::from("/corpus")),
        ..ConfigOverrides::default()
    });
    assert_eq!(config.sources, vec!["gamma".to_string()]);
    assert_eq!(config.seed, 9);
    assert_eq!(config.treatments.len(), 2);
    assert_eq!(
        config.sampler,
        SamplerConfig::Directory {
            corpus: PathBuf::from("/corpus")
        }
    );
}

#[test]
fn debug_mode_isolates_root_and_shrinks_partitions() {
    let mut config = small_config();
    config.data_root = PathBuf::from("/work/data");
    config.debug = true;
    assert_eq!(config.artifact_root(), PathBuf::from("/work/data_debug"));
    assert_eq!(
        config.effective_partitions(),
        vec![PartitionSpec::new("train", DEFAULT_DEBUG_SAMPLE_SIZE)]
    );
    assert_eq!(config.branches().len(), 2);
}

#[test]
fn branches_cross_sources_and_partitions() {
    let config = small_config();
    let keys: Vec<String> = config
        .branches()
        .iter()
        .map(|(branch, size)| format!("{}={size}", branch.stem()))
        .collect();
    assert_eq!(
        keys,
        vec!["alpha_train=20", "alpha_test=8", "beta_train=20", "beta_test=8"]
    );
}

#[test]
fn validate_rejects_unsafe_or_duplicate_names() {
    let mut config = small_config();
    config.sources = vec!["has_underscore".to_string()];
    assert!(validate_config(&config).is_err());

    let mut config = small_config();
    config.treatments = vec!["a".to_string(), "a".to_string()];
    assert!(validate_config(&config).is_err());

    let mut config = small_config();
    config.engines = vec!["x/y".to_string(), "x-y".to_string()];
    assert!(validate_config(&config).is_err());

    let mut config = small_config();
    config.partitions = vec![PartitionSpec::new("train", 0)];
    assert!(validate_config(&config).is_err());

    let mut config = small_config();
    config.max_workers = 0;
    assert!(validate_config(&config).is_err());

    let mut config = small_config();
    config.batch_size = Some(0);
    assert!(validate_config(&config).is_err());
}

#[test]
fn engines_may_contain_slashes() {
    validate_config(&small_config()).expect("slash engines are valid");
}
