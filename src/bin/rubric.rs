#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use rubric_harness::cache::{JudgmentCache, SqliteJudgmentCache};
use rubric_harness::context::{ContextProvider, HttpContextProvider, StaticContextProvider};
use rubric_harness::evaluate::{EvaluationRequest, Evaluator, EvaluatorConfig};
use rubric_harness::export::{grades_to_csv, report_to_csv, GradeRow};
use rubric_harness::extract::extract_detailed;
use rubric_harness::gateway::{ChatGateway, ProviderGateway, TracingUsageSink};
use rubric_harness::grading::Grader;
use rubric_harness::logging::init_tracing;
use rubric_harness::rubric::{self, load_catalog, RubricCatalog, BUILTIN_CATALOGS};
use rubric_harness::segment::segment_with_diagnostics;
use rubric_harness::trace::{JsonlTraceSink, TraceSink};
use rubric_harness::variants::{generate_variants, DEFAULT_VARIANT_COUNT};

#[derive(Parser)]
#[command(name = "rubric", version, about = "Rubric evaluation CLI")]
struct Cli {
    /// Debug-level logging for this crate
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Log filter, e.g. `debug` or `rubric_harness=trace,reqwest=info`
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a subject against a rubric catalog
    Evaluate {
        /// Subject to evaluate (transcript, resume, ...)
        #[arg(long)]
        subject: String,
        /// Entity the subject is compared with, e.g. a job description
        #[arg(long)]
        secondary: Option<String>,
        /// Built-in catalog slug
        #[arg(long, default_value = "instructor")]
        catalog: String,
        /// JSON catalog file; overrides --catalog
        #[arg(long)]
        catalog_file: Option<PathBuf>,
        /// Restrict to these dimensions (repeatable)
        #[arg(long = "dimension")]
        dimensions: Vec<String>,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        context: ContextArgs,
        /// SQLite judgment cache; no caching when omitted
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        lock_cache: bool,
        /// Per-dimension JSONL trace
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Report JSON; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Grade a Q&A submission (`-` reads stdin)
    Grade {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "")]
        full_name: String,
        #[arg(long, default_value = "")]
        user_id: String,
        #[arg(long, default_value = "")]
        email: String,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        context: ContextArgs,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Gradebook CSV with a single learner row
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Split a submission into question/answer units
    Segment {
        #[arg(long)]
        input: PathBuf,
    },
    /// Extract a score from a saved judgment
    Extract {
        #[arg(long)]
        input: PathBuf,
        /// Extract every dimension of this built-in catalog
        #[arg(long, conflicts_with = "dimension")]
        catalog: Option<String>,
        #[arg(long)]
        dimension: Option<String>,
        #[arg(long, default_value_t = 0)]
        min: i64,
        #[arg(long, default_value_t = 3)]
        max: i64,
    },
    /// Generate reworded variants of a question
    Variants {
        #[arg(long)]
        question: String,
        #[arg(long, default_value_t = DEFAULT_VARIANT_COUNT)]
        count: usize,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        context: ContextArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List built-in catalogs, or print one as JSON
    Catalog {
        slug: Option<String>,
        #[arg(long, conflicts_with = "slug")]
        file: Option<PathBuf>,
    },
    /// Export SQLite judgment cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite judgment cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long, env = "RUBRIC_LLM_MODEL")]
    model: Option<String>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Per-dimension timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long)]
    max_output_tokens: Option<u32>,
    #[arg(long)]
    max_context_tokens: Option<usize>,
}

impl ModelArgs {
    fn config(&self) -> EvaluatorConfig {
        let mut config = EvaluatorConfig::from_env();
        if let Some(model) = &self.model {
            config = config.with_model(model.clone());
        }
        if let Some(n) = self.concurrency {
            config = config.with_concurrency(n);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_dimension_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_output_tokens {
            config = config.with_max_output_tokens(max);
        }
        if let Some(max) = self.max_context_tokens {
            config = config.with_max_context_tokens(max);
        }
        config
    }
}

#[derive(Args)]
struct ContextArgs {
    /// Use this file as the only context passage
    #[arg(long, conflicts_with = "context_url")]
    context_file: Option<PathBuf>,
    /// Retrieval service base URL
    #[arg(long, env = "RUBRIC_CONTEXT_URL")]
    context_url: Option<String>,
}

impl ContextArgs {
    fn provider(&self) -> Result<Arc<dyn ContextProvider>, Box<dyn std::error::Error>> {
        if let Some(path) = &self.context_file {
            return Ok(Arc::new(StaticContextProvider::from_file(path)?));
        }
        let provider = match &self.context_url {
            Some(url) => HttpContextProvider::new(url.clone())?,
            None => HttpContextProvider::from_env()?,
        };
        Ok(Arc::new(provider))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_level.as_deref(), cli.log_json)?;

    match cli.command {
        Commands::Evaluate {
            subject,
            secondary,
            catalog,
            catalog_file,
            dimensions,
            model,
            context,
            cache,
            lock_cache,
            trace,
            out,
            csv,
        } => {
            let mut catalog = match catalog_file {
                Some(path) => load_catalog(&path)?,
                None => rubric::builtin(&catalog)?,
            };
            if !dimensions.is_empty() {
                catalog = catalog.subset(dimensions.as_slice())?;
            }
            let mut req = EvaluationRequest::new(subject, catalog);
            if let Some(secondary) = secondary {
                req = req.with_secondary(secondary);
            }

            let mut evaluator = Evaluator::new(gateway()?, context.provider()?, model.config());

            let cache = cache.map(SqliteJudgmentCache::new).transpose()?;
            let _lock = match (&cache, lock_cache) {
                (Some(cache), true) => Some(cache.lock_exclusive()?),
                _ => None,
            };
            if let Some(cache) = &cache {
                evaluator = evaluator.with_cache(Arc::new(cache.clone()) as Arc<dyn JudgmentCache>);
            }

            let trace_worker = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    evaluator = evaluator.with_trace(Arc::new(sink) as Arc<dyn TraceSink>);
                    Some(worker)
                }
                None => None,
            };

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = Arc::clone(&cancel);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received; remaining dimensions will be skipped");
                        cancel.store(true, Ordering::Relaxed);
                    }
                });
            }

            let report = evaluator.evaluate_with_cancel(req, &cancel).await?;
            // The sink lives inside the evaluator; drop it so the worker can finish.
            drop(evaluator);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            if let Some(overall) = &report.overall {
                eprintln!("{}", overall.explanation);
            }
            if let Some(path) = csv {
                report_to_csv(&report, File::create(path)?)?;
            }
            emit_json(out.as_deref(), &report)?;
        }
        Commands::Grade {
            input,
            full_name,
            user_id,
            email,
            model,
            context,
            out,
            csv,
        } => {
            let text = read_input(&input)?;
            let grader = Grader::new(gateway()?, context.provider()?, model.config());
            let graded = grader.grade_submission(&text).await;

            eprintln!("total score: {:.2}", graded.total_score);
            if let Some(path) = csv {
                let row = GradeRow::from_submission(full_name, user_id, email, &graded);
                grades_to_csv(&[row], File::create(path)?)?;
            }
            emit_json(out.as_deref(), &graded)?;
        }
        Commands::Segment { input } => {
            let text = read_input(&input)?;
            let report = segment_with_diagnostics(&text);
            emit_json(None, &report)?;
        }
        Commands::Extract {
            input,
            catalog,
            dimension,
            min,
            max,
        } => {
            let text = read_input(&input)?;
            let extracted = match (catalog, dimension) {
                (Some(slug), _) => rubric::builtin(&slug)?
                    .iter()
                    .map(|dim| extract_detailed(dim.name(), &text, dim.scale_min(), dim.scale_max()))
                    .collect::<Vec<_>>(),
                (None, Some(name)) => {
                    if min > max {
                        return Err(format!("--min {min} is greater than --max {max}").into());
                    }
                    vec![extract_detailed(&name, &text, min, max)]
                }
                (None, None) => return Err("extract requires --dimension or --catalog".into()),
            };
            emit_json(None, &extracted)?;
        }
        Commands::Variants {
            question,
            count,
            model,
            context,
            out,
        } => {
            let gateway = gateway()?;
            let provider = context.provider()?;
            let set = generate_variants(
                gateway.as_ref(),
                provider.as_ref(),
                &question,
                count,
                &model.config(),
            )
            .await?;
            emit_json(out.as_deref(), &set)?;
        }
        Commands::Catalog { slug, file } => {
            let catalog: Option<RubricCatalog> = match (slug, file) {
                (_, Some(path)) => Some(load_catalog(&path)?),
                (Some(slug), None) => Some(rubric::builtin(&slug)?),
                (None, None) => None,
            };
            match catalog {
                Some(catalog) => emit_json(None, &catalog)?,
                None => {
                    for slug in BUILTIN_CATALOGS {
                        let catalog = rubric::builtin(slug)?;
                        println!("{slug}\t{} dimensions", catalog.len());
                    }
                }
            }
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteJudgmentCache::default_path);
            let cache = SqliteJudgmentCache::new(path)?;
            let written = cache.export_jsonl(out).await?;
            eprintln!("exported {written} rows");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteJudgmentCache::default_path);
            let cache = SqliteJudgmentCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

fn gateway() -> Result<Arc<dyn ChatGateway>, Box<dyn std::error::Error>> {
    let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;
    Ok(Arc::new(gateway))
}

fn read_input(path: &Path) -> Result<String, io::Error> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path)
}

fn emit_json<T: serde::Serialize>(path: Option<&Path>, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    match path {
        Some(path) => std::fs::write(path, json),
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{json}")
        }
    }
}
