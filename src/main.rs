use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use review_emails::config::{self, MailImplementation};
use review_emails::db;
use review_emails::mail::{FsMail, MailTransport, SmtpMail};
use review_emails::service::{self, Pipeline};
use review_emails::source::{FeedSource, FileSource, HttpFeedSource};
use review_emails::template::BuiltinTemplates;
use review_emails::worker::{FeedWorker, RunOnceWorker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed the feed position to "now". Must run once before `service`.
    Prepare,
    /// Poll the feed and send emails until shut down.
    Service,
    /// Run one poll from the given feed position and exit.
    RunOnce {
        #[arg(long, default_value_t = 0)]
        from_key: i64,
    },
    /// Print an example configuration file.
    ExampleConfig,
}

fn build_source(feed: &config::Feed) -> Box<dyn FeedSource> {
    match &feed.file {
        Some(path) => Box::new(FileSource::new(PathBuf::from(path))),
        None => Box::new(HttpFeedSource::new(
            feed.normalized_host(),
            feed.token.clone(),
            feed.story_limit,
        )),
    }
}

fn build_mail(email: &config::Email) -> Result<Box<dyn MailTransport>> {
    match email.implementation {
        MailImplementation::Fs => {
            let Some(fs) = &email.fs else {
                bail!("email.implementation is \"fs\" but email.fs is not configured");
            };
            Ok(Box::new(FsMail::new(
                &email.from_address,
                Path::new(&fs.output_path),
            )?))
        }
        MailImplementation::Smtp => {
            let Some(smtp) = &email.smtp else {
                bail!("email.implementation is \"smtp\" but email.smtp is not configured");
            };
            Ok(Box::new(SmtpMail::new(
                &smtp.host,
                &email.from_address,
                email.send_to.clone(),
            )?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.db.url).await?;
    db::run_migrations(&pool).await?;

    let source = build_source(&cfg.feed);
    let mail = build_mail(&cfg.email)?;
    let templates = BuiltinTemplates;
    let retry_delay = Duration::from_secs(cfg.app.temporary_mail_retry_seconds);
    let pipeline = Pipeline::new(
        source.as_ref(),
        &templates,
        mail.as_ref(),
        retry_delay,
        cfg.app.is_dev,
    );

    match args.command {
        Command::Prepare => {
            service::prepare(&pool, source.as_ref()).await?;
        }
        Command::Service => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
            });

            let poll_gap = Duration::from_secs(cfg.app.poll_gap_seconds);
            let mut worker = FeedWorker::new(pool.clone(), poll_gap, shutdown_rx);
            worker.process(&pipeline).await?;
        }
        Command::RunOnce { from_key } => {
            let worker = RunOnceWorker::new(pool.clone(), from_key);
            worker.process(&pipeline).await?;
        }
        Command::ExampleConfig => unreachable!(),
    }

    Ok(())
}
