use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wampbench::activity::ActivityLog;
use wampbench::wamp::config::DEFAULT_ROUTER_URL;
use wampbench::wamp::transport::{LoopbackTransport, Transport, WebSocketTransport};
use wampbench::wamp::{InboundMessage, Realm, RealmTopicConfig, ScheduleSpec, SessionState};
use wampbench::{PublishTarget, Workbench};

#[derive(Parser)]
#[command(name = "wampbench", about = "Publish to and listen on WAMP realms")]
struct Cli {
    /// Realm/topic configuration file (.json or .toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Audit trail file, overrides the configured one
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    /// Use the in-process router instead of the network
    #[arg(long, global = true)]
    loopback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured realms and their topics
    Realms,
    /// Publish one payload to one or more topics of a realm
    Publish {
        #[arg(long)]
        realm: String,
        /// Router endpoint, overrides the configured one
        #[arg(long)]
        url: Option<String>,
        /// Target topic; repeat for several, omit for all configured topics
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// JSON payload; anything that is not JSON is sent as a string
        #[arg(long)]
        payload: String,
        /// Send after HH:MM:SS
        #[arg(long = "in", conflicts_with = "at")]
        after: Option<String>,
        /// Send at local wall-clock HH:MM:SS
        #[arg(long)]
        at: Option<String>,
    },
    /// Print messages from topics of a realm until interrupted
    Subscribe {
        #[arg(long)]
        realm: String,
        #[arg(long)]
        url: Option<String>,
        /// Topic to listen on; repeat for several, omit for all configured topics
        #[arg(long = "topic")]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref()).await?;

    if let Command::Realms = cli.command {
        print_realms(&config);
        return Ok(());
    }

    let mut settings = config.settings.clone();
    if let Some(path) = cli.audit_log {
        settings.audit_log = path;
    }

    let transport: Arc<dyn Transport> = if cli.loopback {
        info!("Using the in-process loopback router");
        Arc::new(LoopbackTransport::new())
    } else {
        Arc::new(WebSocketTransport::new(settings.join_timeout()))
    };

    let (activity, audit_worker) = ActivityLog::with_audit_file(
        settings.audit_log.clone(),
        settings.retained_records,
    );
    let mut sink_errors = activity.errors();
    tokio::spawn(async move {
        while let Ok(e) = sink_errors.recv().await {
            eprintln!("warning: {}", e);
        }
    });

    let workbench = Workbench::new(transport, activity.clone(), settings);

    let outcome = match cli.command {
        Command::Publish {
            realm,
            url,
            topics,
            payload,
            after,
            at,
        } => {
            let schedule = match (after, at) {
                (Some(time), _) => ScheduleSpec::parse("duration", &time)?,
                (_, Some(time)) => ScheduleSpec::parse("wallclock", &time)?,
                _ => ScheduleSpec::Immediate,
            };
            let realm = resolve_realm(&config, &realm, url.as_deref())?;
            let topics = resolve_topics(&config, &realm, topics)?;
            run_publish(&workbench, &realm, &topics, parse_payload(&payload), &schedule).await
        }
        Command::Subscribe { realm, url, topics } => {
            let realm = resolve_realm(&config, &realm, url.as_deref())?;
            let topics = resolve_topics(&config, &realm, topics)?;
            run_subscribe(&workbench, &realm, &topics).await
        }
        Command::Realms => Ok(()),
    };

    if let Err(e) = workbench.shutdown().await {
        warn!("Shutdown incomplete: {}", e);
    }
    info!("{} activity record(s) this run", activity.len());

    drop(workbench);
    drop(activity);
    if let Err(e) = audit_worker.await {
        warn!("Audit worker ended abnormally: {}", e);
    }

    outcome
}

async fn run_publish(
    workbench: &Workbench,
    realm: &Realm,
    topics: &[String],
    payload: Value,
    schedule: &ScheduleSpec,
) -> Result<()> {
    workbench
        .start_publisher(realm)
        .await
        .map_err(|e| eyre!("Failed to start publisher on {}: {}", realm, e))?;

    let targets: Vec<PublishTarget> = topics
        .iter()
        .map(|topic| PublishTarget::new(realm.name(), topic))
        .collect();

    let mut longest_delay = 0;
    let mut failed = 0;
    for (target, result) in workbench.publish_batch(&targets, payload, schedule).await {
        match result {
            Ok(delay) => {
                println!("{}: scheduled in {}s", target, delay);
                longest_delay = longest_delay.max(delay);
            }
            Err(e) => {
                println!("{}: {}", target, e);
                failed += 1;
            }
        }
    }

    if longest_delay > 0 {
        info!("Waiting {}s for scheduled publishes", longest_delay);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(longest_delay) + Duration::from_millis(500)) => {}
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, pending publishes are dropped"),
        }
    } else {
        // Let the session loop drain its queue before leaving.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if failed > 0 {
        return Err(eyre!("{} of {} publish(es) failed", failed, targets.len()));
    }
    Ok(())
}

async fn run_subscribe(workbench: &Workbench, realm: &Realm, topics: &[String]) -> Result<()> {
    let mut status = workbench
        .start_subscriber(realm, topics, |message: InboundMessage| {
            println!("{}", message.render());
        })
        .await
        .map_err(|e| eyre!("Failed to start subscriber on {}: {}", realm, e))?;

    info!("Listening on {} topic(s), Ctrl+C to stop", topics.len());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            changed = status.changed() => {
                let state = status.borrow().state.clone();
                if changed.is_err() || state == SessionState::Closed {
                    let reason = status.borrow().error_messages.last().cloned();
                    return Err(eyre!(
                        "Subscriber session ended: {}",
                        reason.unwrap_or_else(|| state.to_string())
                    ));
                }
            }
        }
    }
}

async fn load_config(path: Option<&PathBuf>) -> Result<RealmTopicConfig> {
    if let Some(path) = path {
        return RealmTopicConfig::load(path)
            .await
            .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e));
    }

    let default_path = RealmTopicConfig::default_path();
    if default_path.exists() {
        return RealmTopicConfig::load(&default_path)
            .await
            .map_err(|e| eyre!("Failed to load {}: {}", default_path.display(), e));
    }

    debug!("No configuration at {}", default_path.display());
    Ok(RealmTopicConfig::default())
}

fn resolve_realm(config: &RealmTopicConfig, name: &str, url: Option<&str>) -> Result<Realm> {
    if let Some(url) = url {
        return Ok(Realm::new(name, url)?);
    }
    match config.realm(name) {
        Ok(realm) => Ok(realm),
        Err(_) => {
            warn!(
                "Realm {} is not configured, using {}",
                name, DEFAULT_ROUTER_URL
            );
            Ok(Realm::new(name, DEFAULT_ROUTER_URL)?)
        }
    }
}

fn resolve_topics(
    config: &RealmTopicConfig,
    realm: &Realm,
    topics: Vec<String>,
) -> Result<Vec<String>> {
    if !topics.is_empty() {
        return Ok(topics);
    }
    let configured = config.topics(realm.name());
    if configured.is_empty() {
        return Err(eyre!(
            "No topics given and none configured for realm {}",
            realm.name()
        ));
    }
    Ok(configured.to_vec())
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_realms(config: &RealmTopicConfig) {
    if config.realms.is_empty() {
        println!("No realms configured");
        return;
    }
    for (name, entry) in &config.realms {
        println!("{} ({})", name, entry.router_url);
        for topic in &entry.topics {
            println!("  {}", topic);
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}
