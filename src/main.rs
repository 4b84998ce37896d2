use audioprov::cli::{CacheAction, Cli, Commands, ConfigAction};
use audioprov::config::EngineConfig;
use audioprov::embedding::SqliteEmbeddingCache;
use audioprov::error::{AudioProvError, Result};
use audioprov::evaluation::{replay, EvaluationSummary, RecordedQuery};
use audioprov::query::{QueryRequest, QueryResult};
use audioprov::ranking::SeverityTier;
use audioprov::segment::{wav, Segmenter};
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    match cli.command {
        Commands::Segment {
            input,
            all_scales,
            json,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_segment(&config, &input, all_scales, json)?;
        }
        Commands::Rank {
            matches,
            transform,
            severity,
            topk,
            json,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_rank(&config, &matches, transform, severity, topk, json)?;
        }
        Commands::Evaluate { results, json } => {
            cmd_evaluate(&results, json)?;
        }
        Commands::Cache { action } => {
            cmd_cache(action)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "audioprov=debug" } else { "audioprov=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_segment(config: &EngineConfig, input: &Path, all_scales: bool, json: bool) -> Result<()> {
    let (asset, samples) = wav::load_wav(input)?;
    let segmenter = Segmenter::new(config.segmentation.clone());

    let segments = if all_scales {
        let mut scales = vec![config.segmentation.primary.clone()];
        scales.extend(config.segmentation.escalation.iter().cloned());
        segmenter.segment_scales(&asset, &samples, &scales)
    } else {
        segmenter.segment(&asset, &samples)
    }
    .map_err(|e| AudioProvError::InvalidInput(e.to_string()))?;

    if json {
        println!("{}", to_json(&segments, "segments")?);
        return Ok(());
    }

    println!(
        "{} ({:.2}s, {} Hz, {} channel(s))",
        asset.id, asset.duration_secs, asset.sample_rate, asset.channels
    );
    println!("{} segments", segments.len());
    for segment in &segments {
        println!(
            "  {:<12} {:>8.2}s - {:>8.2}s  weight {:.3}",
            segment.id.to_string(),
            segment.start_secs,
            segment.end_secs,
            segment.weight
        );
    }

    Ok(())
}

fn cmd_rank(
    config: &EngineConfig,
    matches: &Path,
    transform: Option<String>,
    severity: Option<String>,
    topk: Option<usize>,
    json: bool,
) -> Result<()> {
    let recorded: RecordedQuery = read_json(matches)?;

    let mut request = QueryRequest::new();
    if let Some(label) = transform {
        request = request.with_transform_label(&label);
    }
    if let Some(severity) = severity {
        let tier: SeverityTier = severity.parse().map_err(AudioProvError::InvalidInput)?;
        request = request.with_severity(tier);
    }
    if let Some(topk) = topk {
        request = request.with_topk(topk);
    }

    let rt = tokio::runtime::Runtime::new().map_err(|e| AudioProvError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })?;
    let result = rt
        .block_on(replay(config, &recorded, &request))
        .map_err(|e| AudioProvError::Other(anyhow::Error::new(e)))?;

    if json {
        println!("{}", to_json(&result, "rank result")?);
        return Ok(());
    }

    println!("Query: {}", result.asset_id);
    println!(
        "Transform: {} ({} tier, threshold {:.2}, {:?} fusion)",
        result.transform, result.tier, result.threshold, result.fusion
    );
    if result.accepted {
        println!("✓ Accepted");
    } else {
        println!("✗ Rejected: no candidate reached the threshold");
    }

    for (i, candidate) in result.candidates.iter().enumerate() {
        let marker = if candidate.revalidated() { " (revalidated)" } else { "" };
        println!(
            "  {}. {:<24} {:.4}  rank1 {:.2}  segments {}{}",
            i + 1,
            candidate.asset_id,
            candidate.final_score,
            candidate.components.rank1_ratio,
            candidate.supporting_segments,
            marker
        );
    }
    for candidate in &result.near_misses {
        println!(
            "  ~  {:<24} {:.4}  (below threshold)",
            candidate.asset_id, candidate.final_score
        );
    }

    if let Some(expected) = &result.expected_asset_id {
        let hit = result.top().map(|c| &c.asset_id == expected).unwrap_or(false);
        println!("Expected source: {} ({})", expected, if hit { "hit" } else { "miss" });
    }

    Ok(())
}

fn cmd_evaluate(results: &Path, json: bool) -> Result<()> {
    let results: Vec<QueryResult> = read_json(results)?;
    let summary = EvaluationSummary::from_results(&results);

    if json {
        println!("{}", to_json(&summary, "evaluation summary")?);
        return Ok(());
    }

    println!("Evaluation Summary");
    println!("==================");
    println!("Queries:           {}", summary.total);
    println!("True accepts:      {}", summary.true_accepts);
    println!("False accepts:     {}", summary.false_accepts);
    println!("False rejects:     {}", summary.false_rejects);
    println!("True rejects:      {}", summary.true_rejects);
    println!("Failures:          {}", summary.failures);
    println!("Top-1 accuracy:    {:.2}%", summary.top1_accuracy * 100.0);
    println!("False accept rate: {:.2}%", summary.false_accept_rate * 100.0);
    println!(
        "Latency:           mean {:.1}ms, p95 {}ms",
        summary.mean_latency_ms, summary.p95_latency_ms
    );

    Ok(())
}

fn cmd_cache(action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Stats { db } => {
            let cache = SqliteEmbeddingCache::open(&db)?;
            let stats = cache.stats()?;
            println!("Cache: {}", db.display());
            println!("  Entries: {}", stats.entries);
            println!("  Assets:  {}", stats.assets);
            println!("  Stored:  {} bytes", stats.stored_bytes);
        }
        CacheAction::Purge { db, asset } => {
            let cache = SqliteEmbeddingCache::open(&db)?;
            let removed = cache.purge(asset.as_deref())?;
            match asset {
                Some(asset) => println!("✓ Purged {} entries for {}", removed, asset),
                None => println!("✓ Purged {} entries", removed),
            }
        }
    }

    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, profile)?;
            let value = serde_json::to_value(&config).map_err(|e| AudioProvError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;

            let shown = match section {
                Some(section) => value.get(&section).cloned().ok_or_else(|| {
                    AudioProvError::Config(format!("Unknown config section: {}", section))
                })?,
                None => value,
            };
            println!("{}", to_json(&shown, "config")?);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => EngineConfig::default_path()?,
            };
            let config = EngineConfig::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => EngineConfig::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            EngineConfig::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<EngineConfig> {
    let path = match config_path {
        Some(path) => path,
        None => EngineConfig::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'audioprov config init' to create one."
        );
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        return Ok(config);
    }

    if let Some(profile) = profile {
        EngineConfig::load_with_profile(&path, &profile)
    } else {
        EngineConfig::load(&path)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| AudioProvError::Io {
        source: e,
        context: format!("Failed to read {:?}", path),
    })?;
    serde_json::from_str(&content).map_err(|e| AudioProvError::Json {
        source: e,
        context: format!("Failed to parse {:?}", path),
    })
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| AudioProvError::Json {
        source: e,
        context: format!("Failed to serialize {}", what),
    })
}
