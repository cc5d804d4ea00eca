use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tutordesk::clock::SystemClock;
use tutordesk::config::Config;
use tutordesk::gateway::HttpGateway;
use tutordesk::model::{EntityType, Operation, OperationType, Payload};
use tutordesk::store::SqliteStore;
use tutordesk::{CoreContext, Error, SaveOutcome};

#[derive(Parser, Debug)]
#[command(name = "tutordesk")]
#[command(about = "Offline-tolerant client core for the tutoring desk")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tutordesk/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a remote operation through the cache
  Fetch {
    operation: String,
    /// Arguments as JSON (an array is passed positionally)
    #[arg(long)]
    params: Option<String>,
  },
  /// Write an entity, queueing it when the remote is unreachable
  Save {
    entity_type: EntityType,
    entity_id: String,
    op_type: String,
    /// Entity data as a JSON object
    #[arg(long)]
    data: String,
  },
  /// List changes waiting to be synced
  Queue,
  /// Replay queued changes now
  Sync,
  /// Sweep expired cache entries and stale queued changes
  Cleanup,
  /// Run background tasks and print core events until Ctrl-C
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let data_dir = Config::data_dir()?;
  let _log_guard = init_logging(&data_dir)?;

  let db_path = config
    .storage
    .path
    .clone()
    .unwrap_or_else(|| SqliteStore::default_path(&data_dir));
  let store = SqliteStore::open(&db_path)?.with_quota(config.storage.quota_bytes);
  let gateway = HttpGateway::new(&config.gateway.url)?;

  let ctx = CoreContext::new(config, Arc::new(gateway), Arc::new(store), Arc::new(SystemClock));
  run(&ctx, args.command).await
}

async fn run(ctx: &Arc<CoreContext>, command: Command) -> Result<()> {
  match command {
    Command::Fetch { operation, params } => {
      let params = match params {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Null,
      };
      let result = ctx.fetch::<Value>(&operation, params).await?;
      tracing::debug!(source = ?result.source, "fetched");
      println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Command::Save {
      entity_type,
      entity_id,
      op_type,
      data,
    } => {
      let payload = payload_for(entity_type, serde_json::from_str(&data)?)?;
      let operation = Operation::new(entity_type, entity_id, OperationType::from(op_type.as_str()));
      match ctx.save(operation, payload).await? {
        SaveOutcome::Saved(value) => println!("saved: {}", value),
        SaveOutcome::Queued { change, cause } => match cause {
          Some(Error::CircuitOpen(_)) => println!(
            "service temporarily unavailable, queued as {}",
            change.change_id
          ),
          Some(e) => println!("save failed ({}), queued as {}", e, change.change_id),
          None => println!("offline, queued as {} (will sync when online)", change.change_id),
        },
        SaveOutcome::Resolved { strategy, value } => {
          println!("conflict resolved with {}: {}", strategy, value)
        }
        SaveOutcome::NeedsResolution {
          conflicts,
          message,
          options,
        } => {
          println!("{}", message);
          for conflict in &conflicts {
            println!("  {} {}: {}", conflict.id, conflict.kind, conflict.message);
          }
          for option in &options {
            println!("  [{}] {} - {}", option.id, option.label, option.description);
          }
        }
      }
    }
    Command::Queue => {
      let pending = ctx.queue().list();
      if pending.is_empty() {
        println!("No pending changes");
      }
      for change in pending {
        println!(
          "{}  {}  {}  {}",
          change.change_id,
          change.enqueued_at.to_rfc3339(),
          change.key,
          change.operation.op_type
        );
      }
    }
    Command::Sync => {
      let report = ctx.sync_now().await;
      match report.error {
        Some(e) => println!(
          "synced {}, {} remaining: {}",
          report.synced, report.remaining, e
        ),
        None => println!("synced {}, {} remaining", report.synced, report.remaining),
      }
    }
    Command::Cleanup => {
      let report = ctx.cleanup();
      println!(
        "swept {} cache entries, discarded {} stale changes",
        report.cache_swept, report.queue_discarded
      );
    }
    Command::Watch => watch(ctx).await?,
  }
  Ok(())
}

async fn watch(ctx: &Arc<CoreContext>) -> Result<()> {
  let mut events = ctx.subscribe();
  ctx.start();
  println!("Watching core events, Ctrl-C to stop");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => println!("{}", serde_json::to_string(&event)?),
        Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
        Err(RecvError::Closed) => break,
      },
    }
  }

  ctx.shutdown();
  Ok(())
}

fn payload_for(entity_type: EntityType, data: Value) -> Result<Payload> {
  Ok(match entity_type {
    EntityType::Client => Payload::Client(serde_json::from_value(data)?),
    EntityType::Notes => Payload::Notes(serde_json::from_value(data)?),
    EntityType::Preferences | EntityType::SystemSettings => match data {
      Value::Object(map) => Payload::Settings(map),
      other => return Err(eyre!("{} data must be a JSON object, got {}", entity_type, other)),
    },
  })
}

/// Log to a daily file under the data directory; stdout stays for command output.
fn init_logging(data_dir: &std::path::Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "tutordesk.log",
  ));
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("info,tutordesk=debug"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
