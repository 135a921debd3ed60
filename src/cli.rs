use crate::{
    api::HttpApi,
    cache::LocalJobCache,
    config::Config,
    coordinator::JobCoordinator,
    error::humanize,
    record::OptionSet,
    store::FileStore,
    upload::{FileRules, UploadOutcome, UploadRequest, UploadStage, Uploader},
    util::{ensure_dir, now_rfc3339},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

type HttpCoordinator = JobCoordinator<FileStore, HttpApi>;

#[derive(Parser, Debug)]
#[command(name = "formatdesk")]
#[command(about = "Format LaTeX projects for journal templates and keep a job history")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./formatdesk.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a .zip project or a single .tex file for formatting.
    Upload {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        template: Option<String>,
        /// Transformation to enable (repeatable), e.g. fix_citations.
        #[arg(long = "option")]
        options: Vec<String>,
        /// Do not enable the configured default options.
        #[arg(long)]
        no_default_options: bool,
    },
    /// List past jobs, newest first.
    Jobs {},
    /// Remove one job from the history.
    Remove {
        #[arg(long)]
        id: String,
    },
    /// Clear the locally saved history.
    Clear {},
    /// Check that the formatting service is reachable.
    Health {},
    /// Show known templates and options.
    Templates {},
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")?;

    rt.block_on(async {
        match &args.cmd {
            Command::Upload {
                input,
                template,
                options,
                no_default_options,
            } => {
                let options = select_options(&cfg, options, *no_default_options)?;
                upload(&cfg, input, template.as_deref(), options).await
            }
            Command::Jobs {} => jobs(&cfg).await,
            Command::Remove { id } => remove(&cfg, id).await,
            Command::Clear {} => clear(&cfg).await,
            Command::Health {} => health(&cfg).await,
            Command::Templates {} => templates(&cfg),
        }
    })
}

fn load_config(user: Option<&Path>) -> Result<Config> {
    if let Some(p) = user {
        return Config::load(p);
    }
    let default = PathBuf::from("formatdesk.toml");
    if default.exists() {
        Config::load(&default)
    } else {
        Ok(Config::from_env())
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output, so logs go to stderr.
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    Some(PathBuf::from(&cfg.paths.cache_dir).join("formatdesk.log"))
}

fn build(cfg: &Config) -> Result<(Arc<HttpApi>, Arc<HttpCoordinator>)> {
    let api = Arc::new(HttpApi::new(&cfg.api)?);
    let store = FileStore::for_origin(Path::new(&cfg.paths.cache_dir), api.base_url());
    debug!("job cache dir: {}", store.dir().display());
    let cache = LocalJobCache::with_capacity(
        store,
        cfg.history.storage_key.clone(),
        cfg.history.max_records,
    );
    let coordinator = JobCoordinator::new(cache, Arc::clone(&api))
        .with_write_through(cfg.history.write_through);
    Ok((api, Arc::new(coordinator)))
}

fn select_options(cfg: &Config, requested: &[String], no_defaults: bool) -> Result<OptionSet> {
    let mut options = OptionSet::new();
    if !no_defaults {
        for key in &cfg.upload.default_options {
            options.insert(key.clone());
        }
    }
    for key in requested {
        if !cfg.upload.options.iter().any(|o| o == key) {
            return Err(anyhow!(
                "unknown option: {key} (known: {})",
                cfg.upload.options.join(", ")
            ));
        }
        options.insert(key.clone());
    }
    Ok(options)
}

fn resolve_template(cfg: &Config, requested: Option<&str>) -> Result<String> {
    let template = requested.unwrap_or(cfg.upload.default_template.as_str());
    if !cfg.upload.templates.iter().any(|t| t.value == template) {
        let known: Vec<&str> = cfg.upload.templates.iter().map(|t| t.value.as_str()).collect();
        return Err(anyhow!(
            "unknown template: {template} (known: {})",
            known.join(", ")
        ));
    }
    Ok(template.to_string())
}

async fn upload(cfg: &Config, input: &Path, template: Option<&str>, options: OptionSet) -> Result<()> {
    let template = resolve_template(cfg, template)?;
    let (api, coordinator) = build(cfg)?;
    let rules = FileRules::new(&cfg.upload)?;
    let uploader = Arc::new(Uploader::new(Arc::clone(&coordinator), api, rules));

    let mut stages = uploader.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_bucket = None;
        while stages.changed().await.is_ok() {
            let stage = stages.borrow_and_update().clone();
            match stage {
                UploadStage::Uploading { percent } => {
                    let bucket = percent / 10;
                    if last_bucket != Some(bucket) {
                        last_bucket = Some(bucket);
                        info!("upload {percent}%");
                    }
                }
                UploadStage::Processing => info!("processing"),
                _ => {}
            }
        }
    });

    let interrupt = {
        let uploader = Arc::clone(&uploader);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                uploader.cancel();
            }
        })
    };

    let started = now_rfc3339();
    let result = uploader
        .submit(UploadRequest {
            path: input.to_path_buf(),
            template,
            options,
        })
        .await;
    interrupt.abort();

    // Let the history mirror finish before the runtime shuts down.
    coordinator.settle().await;
    drop(uploader);
    reporter.abort();

    match result {
        Ok(UploadOutcome::Completed(record)) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status": "ok",
                    "started": started,
                    "finished": now_rfc3339(),
                    "job": record,
                }))?
            );
            Ok(())
        }
        Ok(UploadOutcome::Cancelled) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "status": "cancelled" }))?
            );
            Ok(())
        }
        Err(err) => {
            let friendly = humanize(&err, cfg.upload.max_bytes);
            Err(anyhow!("{}: {}", friendly.title, friendly.message))
        }
    }
}

async fn jobs(cfg: &Config) -> Result<()> {
    let (_, coordinator) = build(cfg)?;
    let (jobs, source) = coordinator.get_jobs_with_source().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "source": source,
            "count": jobs.len(),
            "jobs": jobs,
        }))?
    );
    Ok(())
}

async fn remove(cfg: &Config, id: &str) -> Result<()> {
    let (_, coordinator) = build(cfg)?;
    coordinator.delete_job(id);
    coordinator.settle().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "removed": id }))?
    );
    Ok(())
}

async fn clear(cfg: &Config) -> Result<()> {
    let (_, coordinator) = build(cfg)?;
    coordinator.clear_all();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "cleared": "local" }))?
    );
    Ok(())
}

async fn health(cfg: &Config) -> Result<()> {
    let (api, _) = build(cfg)?;
    let status = api
        .health()
        .await
        .with_context(|| format!("health check against {}", api.base_url()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn templates(cfg: &Config) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "default_template": cfg.upload.default_template,
            "templates": cfg.upload.templates,
            "options": cfg.upload.options,
            "default_options": cfg.upload.default_options,
        }))?
    );
    Ok(())
}
