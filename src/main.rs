use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing::warn;

use precache::cache::{
  CacheController, CacheStorage, HookDecision, HttpNetwork, Interceptor, MemoryStorage, Network,
  RequestKey, ServedFrom, SqliteStorage,
};
use precache::config::Config;
use precache::logging;

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "Versioned cache-first request interception with offline support")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep the cache in memory instead of the on-disk database
  #[arg(long)]
  no_persist: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the configured version and drop every other stored version
  Install,
  /// Answer one request cache-first
  Get {
    /// Path relative to the origin, or an absolute URL
    target: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
  },
  /// List stored versions
  List,
  /// Delete stored versions that are not kept
  Purge {
    /// Version to keep (repeatable; default: the configured version)
    #[arg(short, long)]
    keep: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  if args.no_persist {
    run(MemoryStorage::new(), &config, args.command).await
  } else {
    run(SqliteStorage::open_default(&config.cache_name)?, &config, args.command).await
  }
}

async fn run<S>(storage: S, config: &Config, command: Command) -> Result<()>
where
  S: CacheStorage + 'static,
{
  let network = HttpNetwork::new(config.network_timeout())?;
  let controller =
    CacheController::with_settings(storage, network.clone(), config.controller_settings());
  let manifest = config.manifest_keys()?;

  match command {
    Command::Install => {
      controller.initialize(&manifest, &config.version).await?;
      let purged = controller.purge_stale([config.version.as_str()])?;
      println!(
        "installed {} ({} entries)",
        config.version,
        controller.storage().entry_count(&config.version)?
      );
      for version in purged {
        println!("purged {}", version);
      }
    }

    Command::Get { target, method } => {
      // Offline or broken manifest: keep going without an active generation
      if let Err(e) = controller.initialize(&manifest, &config.version).await {
        warn!(error = %e, "could not activate {}", config.version);
      }

      let key = RequestKey::resolve(&config.origin, &method, &target)?;
      let interceptor = Interceptor::new(controller, config.scope_url()?)?;

      let (snapshot, source) = match interceptor.handle(&key).await? {
        HookDecision::Respond(served) => {
          let source = match served.source {
            ServedFrom::Store => "store",
            ServedFrom::Network => "network",
          };
          (served.snapshot, source)
        }
        HookDecision::PassThrough => (network.fetch(&key).await?, "pass-through"),
      };

      println!(
        "{} {} -> {} from {} ({} bytes)",
        key.method(),
        key.url(),
        snapshot.status,
        source,
        snapshot.body.len()
      );
      if let Some(content_type) = snapshot.header("content-type") {
        println!("content-type: {}", content_type);
      }
    }

    Command::List => {
      for name in controller.storage().list_names()? {
        let marker = if name == config.version { "*" } else { " " };
        println!(
          "{} {} ({} entries)",
          marker,
          name,
          controller.storage().entry_count(&name)?
        );
      }
    }

    Command::Purge { keep } => {
      let keep = if keep.is_empty() {
        vec![config.version.clone()]
      } else {
        keep
      };
      for version in controller.purge_stale(&keep)? {
        println!("purged {}", version);
      }
    }
  }

  Ok(())
}
