use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use redharvest_core::common::error::Result as HarvestResult;
use redharvest_core::domain::queue;
use redharvest_core::domain::{
    RedditCredentials, ScraperRecord, ScraperStatus, ScraperType, SortOrder,
};
use redharvest_core::security::{seal_credentials, Sealer};
use redharvest_core::storage::{Storage, StoreSpec};

use redharvest_scraper::observability::{logging, metrics};
use redharvest_scraper::reddit::client::RedditClient;
use redharvest_scraper::reddit::rate_limit::RateLimitOracle;
use redharvest_scraper::reddit::transport::CountingTransport;
use redharvest_scraper::reddit::RedditApi;
use redharvest_scraper::shutdown;
use redharvest_scraper::usage::UsageRecorder;
use redharvest_scraper::workers::comments::CommentsWorker;
use redharvest_scraper::workers::posts::PostsWorker;
use redharvest_scraper::workers::rotation::Rotation;
use redharvest_scraper::workers::SubredditAction;

#[derive(Parser)]
#[command(name = "redharvest-scraper")]
#[command(about = "Reddit ingestion worker: rotates over a subreddit queue")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Scraper id: the primary subreddit (without r/).
    scraper_id: String,
    /// Comma-separated subreddit list; replaces the stored queue.
    #[arg(long)]
    subreddits: Option<String>,
    /// Seconds between rotation cycles.
    #[arg(long)]
    interval: Option<u64>,
    /// Run one cycle and exit.
    #[arg(long)]
    single_run: bool,
    /// Print store statistics and exit.
    #[arg(long)]
    stats: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest submissions and community metadata.
    Posts {
        #[command(flatten)]
        common: CommonArgs,
        /// Posts per sort per cycle.
        #[arg(long)]
        posts_limit: Option<usize>,
        /// Comma-separated sort orders (new,hot,rising,top,controversial).
        #[arg(long)]
        sorting_methods: Option<String>,
    },
    /// Harvest comment trees for already-stored posts.
    Comments {
        #[command(flatten)]
        common: CommonArgs,
        /// Posts per comment batch.
        #[arg(long)]
        comment_batch: Option<usize>,
        /// Inclusive comment nesting cap.
        #[arg(long)]
        max_depth: Option<u32>,
    },
}

fn credentials_from_env() -> anyhow::Result<RedditCredentials> {
    let var = |name: &str| std::env::var(name).with_context(|| format!("{name} is not set"));
    Ok(RedditCredentials {
        client_id: var("REDDIT_CLIENT_ID")?,
        client_secret: var("REDDIT_CLIENT_SECRET")?,
        username: var("REDDIT_USERNAME")?,
        password: var("REDDIT_PASSWORD")?,
        user_agent: var("REDDIT_USER_AGENT")?,
    })
}

fn parse_sorts(raw: &str) -> anyhow::Result<Vec<SortOrder>> {
    raw.split(',')
        .map(|s| match s.trim().to_lowercase().as_str() {
            "new" => Ok(SortOrder::New),
            "hot" => Ok(SortOrder::Hot),
            "rising" => Ok(SortOrder::Rising),
            "top" => Ok(SortOrder::Top),
            "controversial" => Ok(SortOrder::Controversial),
            other => anyhow::bail!("unknown sort order '{other}'"),
        })
        .collect()
}

/// Load the scraper record, creating one from the CLI arguments when the
/// wired store has never seen this scraper. A record launched by the
/// control plane is only re-written when a CLI override actually changed
/// it, so concurrent queue mutations are not clobbered at startup.
async fn bootstrap_record(
    storage: &Arc<dyn Storage>,
    scraper_id: &str,
    scraper_type: ScraperType,
    creds: &RedditCredentials,
    common: &CommonArgs,
    tune: impl FnOnce(&mut ScraperRecord) -> bool,
) -> anyhow::Result<ScraperRecord> {
    let (mut record, mut dirty) = match storage.load_scraper(scraper_id).await? {
        Some(existing) => (existing, false),
        None => {
            let sealer = Sealer::from_env()?;
            let record = ScraperRecord::new(
                scraper_id,
                scraper_type,
                Default::default(),
                seal_credentials(&sealer, creds),
            );
            (record, true)
        }
    };

    if let Some(interval) = common.interval {
        record.config.interval_seconds = interval;
        dirty = true;
    }
    if let Some(raw) = &common.subreddits {
        let list: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).collect();
        queue::replace(&mut record, &list)?;
        dirty = true;
    }
    if tune(&mut record) {
        dirty = true;
    }
    if dirty {
        storage.save_scraper(record.clone()).await?;
    }
    Ok(record)
}

async fn print_stats(storage: &Arc<dyn Storage>, record: &ScraperRecord) -> HarvestResult<()> {
    for subreddit in &record.subreddits {
        let posts = storage.posts_count(subreddit).await?;
        let comments = storage.comments_count(subreddit).await?;
        let errors = storage.unresolved_errors(Some(subreddit)).await?.len();
        info!(
            subreddit = %subreddit,
            posts,
            comments,
            unresolved_errors = errors,
            "store statistics"
        );
    }
    info!(
        total_cycles = record.metrics.total_cycles,
        posts_per_hour = record.metrics.posts_per_hour,
        comments_per_hour = record.metrics.comments_per_hour,
        "scraper metrics"
    );
    Ok(())
}

async fn run_worker(
    scraper_type: ScraperType,
    common: &CommonArgs,
    record: ScraperRecord,
    storage: Arc<dyn Storage>,
    api: Arc<dyn RedditApi>,
    oracle: Arc<RateLimitOracle>,
    transport: Arc<CountingTransport>,
) -> anyhow::Result<()> {
    if common.stats {
        print_stats(&storage, &record).await?;
        return Ok(());
    }

    match api.authenticate().await {
        Ok(username) => info!(%username, scraper = %record.id, "worker ready"),
        Err(e) => {
            storage
                .set_scraper_status(&record.id, ScraperStatus::Failed, Some(e.to_string()))
                .await?;
            error!("authentication failed: {e}");
            return Err(e.into());
        }
    }
    storage
        .set_scraper_status(&record.id, ScraperStatus::Running, None)
        .await?;

    let action: Box<dyn SubredditAction> = match scraper_type {
        ScraperType::Posts => Box::new(PostsWorker::new(api, storage.clone())),
        ScraperType::Comments => Box::new(CommentsWorker::new(api, storage.clone())),
    };

    let recorder = UsageRecorder::new(storage.clone(), scraper_type);
    let shutdown = shutdown::from_signals();
    let mut rotation = Rotation::new(
        storage.clone(),
        oracle,
        transport,
        recorder,
        record.id.clone(),
        shutdown,
    );

    let outcome = if common.single_run {
        rotation.run_cycle(action.as_ref()).await.map(|_| ())
    } else {
        rotation.run(action.as_ref()).await
    };

    match outcome {
        Ok(()) => {
            storage
                .set_scraper_status(&record.id, ScraperStatus::Stopped, None)
                .await?;
            Ok(())
        }
        Err(e) => {
            storage
                .set_scraper_status(&record.id, ScraperStatus::Failed, Some(e.to_string()))
                .await?;
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging("scraper");
    metrics::init();

    let cli = Cli::parse();
    let creds = credentials_from_env()?;
    // The supervisor forwards its own store location through the
    // environment, so worker and control plane read and write the same
    // collections.
    let store_spec = StoreSpec::from_env();
    let storage: Arc<dyn Storage> = store_spec.open()?;

    let (scraper_type, common) = match &cli.command {
        Commands::Posts { common, .. } => (ScraperType::Posts, common),
        Commands::Comments { common, .. } => (ScraperType::Comments, common),
    };

    let oracle = Arc::new(RateLimitOracle::default());
    let transport = Arc::new(CountingTransport::new(
        oracle.clone(),
        scraper_type,
        &creds.user_agent,
    )?);
    let api: Arc<dyn RedditApi> = Arc::new(RedditClient::new(
        transport.clone(),
        oracle.clone(),
        creds.clone(),
    ));

    let record = match &cli.command {
        Commands::Posts {
            common,
            posts_limit,
            sorting_methods,
        } => {
            let sorts = sorting_methods.as_deref().map(parse_sorts).transpose()?;
            bootstrap_record(
                &storage,
                &common.scraper_id,
                ScraperType::Posts,
                &creds,
                common,
                |record| {
                    let mut changed = false;
                    if let Some(limit) = posts_limit {
                        record.config.posts_limit = *limit;
                        changed = true;
                    }
                    if let Some(sorts) = sorts {
                        record.config.sorting_methods = sorts;
                        changed = true;
                    }
                    changed
                },
            )
            .await?
        }
        Commands::Comments {
            common,
            comment_batch,
            max_depth,
        } => {
            bootstrap_record(
                &storage,
                &common.scraper_id,
                ScraperType::Comments,
                &creds,
                common,
                |record| {
                    let mut changed = false;
                    if let Some(batch) = comment_batch {
                        record.config.comment_batch = *batch;
                        changed = true;
                    }
                    if let Some(depth) = max_depth {
                        record.config.max_comment_depth = *depth;
                        changed = true;
                    }
                    changed
                },
            )
            .await?
        }
    };

    info!(
        scraper = %record.id,
        scraper_type = scraper_type.as_str(),
        subreddits = record.subreddits.len(),
        interval = record.config.interval_seconds,
        "starting worker"
    );
    run_worker(scraper_type, common, record, storage, api, oracle, transport).await
}
