//! cfgplaned - operator binary for the cfgplane consistency core
//!
//! ## Commands
//!
//! - `migrate`: create the schema on every shard and seed the id counters
//! - `serve`: run the outbox maintenance loops until interrupted
//! - `cursor`: show or record a shard's consumer cursor
//! - `events`: list outbox events of a shard
//! - `purge` / `sweep`: one maintenance pass over every shard

mod maintenance;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cfgplane_core::{telemetry, EventOutbox, IdGenerator, Kit};
use cfgplane_store::migrations::{init_schema, seed_counters};
use cfgplane_store::{DbConfig, Page, PgShard, Shard, ShardResolver, StaticShardResolver};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, Level};

use crate::maintenance::OutboxMaintenance;

#[derive(Parser)]
#[command(name = "cfgplaned")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "cfgplane consistency core operator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Admin shard connection string (falls back to CFGPLANE_DB_HOST and friends)
    #[arg(long, global = true, env = "CFGPLANE_DB_URL")]
    db_url: Option<String>,

    /// Tenant shard connection strings; tenants map to them by `biz_id % n`.
    /// When empty the admin shard holds every tenant.
    #[arg(long = "shard-url", global = true, env = "CFGPLANE_SHARD_URLS", value_delimiter = ',')]
    shard_urls: Vec<String>,

    /// Operator recorded on writes
    #[arg(long, global = true, env = "CFGPLANE_OPERATOR", default_value = "cfgplaned")]
    operator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables on every shard and seed the id counters on the admin shard
    Migrate,

    /// Run outbox purge and stale-event sweep until Ctrl-C
    Serve(MaintenanceArgs),

    /// Inspect or move a shard's consumer cursor
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },

    /// List outbox events of a shard as JSON lines
    Events {
        /// Shard id (default: the first tenant shard)
        #[arg(long)]
        shard: Option<u32>,

        /// Only events after this id
        #[arg(long, default_value = "0", conflicts_with = "consumed")]
        after: u32,

        /// List consumed events (id <= the shard's cursor) instead of pending ones
        #[arg(long)]
        consumed: bool,

        /// Maximum number of events
        #[arg(short, long, default_value = "100")]
        limit: u32,
    },

    /// Purge old events on every shard once
    Purge {
        /// Retention window in days
        #[arg(long, env = "CFGPLANE_RETENTION_DAYS", default_value = "7")]
        days: u32,
    },

    /// Fail stale Unknown events on every shard once
    Sweep {
        /// Age in seconds after which an Unknown event is failed
        #[arg(long, env = "CFGPLANE_STALE_AFTER", default_value = "300")]
        stale_after: u64,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print the last consumed event id
    Show {
        /// Shard id (default: the first tenant shard)
        #[arg(long)]
        shard: Option<u32>,
    },
    /// Record the last consumed event id
    Record {
        /// Shard id (default: the first tenant shard)
        #[arg(long)]
        shard: Option<u32>,
        /// Event id
        id: u32,
    },
}

#[derive(Args)]
struct MaintenanceArgs {
    /// Retention window in days
    #[arg(long, env = "CFGPLANE_RETENTION_DAYS", default_value = "7")]
    retention_days: u32,

    /// Seconds between purge passes
    #[arg(long, env = "CFGPLANE_PURGE_EVERY", default_value = "3600")]
    purge_every: u64,

    /// Seconds between stale sweeps
    #[arg(long, env = "CFGPLANE_SWEEP_EVERY", default_value = "60")]
    sweep_every: u64,

    /// Age in seconds after which an Unknown event is failed
    #[arg(long, env = "CFGPLANE_STALE_AFTER", default_value = "300")]
    stale_after: u64,

    /// Milliseconds to pause between purge batches
    #[arg(long, env = "CFGPLANE_PURGE_PAUSE_MS", default_value = "50")]
    purge_pause_ms: u64,
}

impl MaintenanceArgs {
    fn settings(&self) -> OutboxMaintenance {
        OutboxMaintenance {
            retention_days: self.retention_days,
            purge_every: Duration::from_secs(self.purge_every),
            sweep_every: Duration::from_secs(self.sweep_every),
            stale_after: Duration::from_secs(self.stale_after),
            ..OutboxMaintenance::default()
        }
    }
}

/// Connected shards: the admin pool first, tenant pools after it.
///
/// The admin pool never serves tenant transactions. Id allocation opens its
/// own admin transaction while a tenant transaction holds a connection, so
/// sharing one pool can exhaust it under load.
struct Topology {
    admin: Arc<PgShard>,
    tenants: Vec<Arc<PgShard>>,
    resolver: Arc<dyn ShardResolver>,
}

impl Topology {
    fn connect(cli: &Cli) -> Result<Self> {
        let base = DbConfig::from_env();
        let admin_cfg = match &cli.db_url {
            Some(url) => DbConfig {
                url: Some(url.clone()),
                ..base.clone()
            },
            None => base.clone(),
        };
        let admin = Arc::new(
            PgShard::connect(0, &admin_cfg).context("Failed to connect to the admin shard")?,
        );

        let mut tenants = Vec::with_capacity(cli.shard_urls.len().max(1));
        if cli.shard_urls.is_empty() {
            // Same database as the admin shard, separate pool.
            let shard = PgShard::connect(admin.id(), &admin_cfg)
                .context("Failed to connect to the tenant pool")?;
            tenants.push(Arc::new(shard));
        }
        for (i, url) in cli.shard_urls.iter().enumerate() {
            let cfg = DbConfig {
                url: Some(url.clone()),
                ..base.clone()
            };
            let id = u32::try_from(i + 1).context("too many shards")?;
            let shard = PgShard::connect(id, &cfg)
                .with_context(|| format!("Failed to connect to tenant shard {}", id))?;
            tenants.push(Arc::new(shard));
        }

        let shards = tenants
            .iter()
            .map(|s| s.clone() as Arc<dyn Shard>)
            .collect();
        let resolver: Arc<dyn ShardResolver> =
            Arc::new(StaticShardResolver::new(admin.clone(), shards)?);
        Ok(Self {
            admin,
            tenants,
            resolver,
        })
    }

    /// The named shard, or the first tenant shard when none is named.
    fn shard(&self, id: Option<u32>) -> Result<Arc<dyn Shard>> {
        match id {
            Some(id) => self
                .resolver
                .by_id(id)
                .ok_or_else(|| anyhow!("no shard with id {}", id)),
            None => self
                .tenants
                .first()
                .map(|s| s.clone() as Arc<dyn Shard>)
                .ok_or_else(|| anyhow!("no tenant shard configured")),
        }
    }

    /// Each database once: the admin shard, then tenant shards on other databases.
    fn databases(&self) -> impl Iterator<Item = &Arc<PgShard>> {
        let admin_id = self.admin.id();
        let others = self.tenants.iter().filter(move |s| s.id() != admin_id);
        std::iter::once(&self.admin).chain(others)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    let topology = Topology::connect(&cli)?;
    let ids = IdGenerator::new(topology.resolver.admin());
    let kit = || Kit::new(cli.operator.clone());

    match &cli.command {
        Commands::Migrate => cmd_migrate(&topology).await,
        Commands::Serve(args) => {
            let outbox = EventOutbox::new(ids)
                .with_purge_pause(Duration::from_millis(args.purge_pause_ms));
            cmd_serve(&topology, &outbox, args.settings()).await
        }
        Commands::Cursor { action } => {
            let outbox = EventOutbox::new(ids);
            match action {
                CursorAction::Show { shard } => {
                    let shard = topology.shard(*shard)?;
                    let cursor = outbox.latest_cursor(&kit(), shard.as_ref()).await?;
                    println!("{}", cursor);
                    Ok(())
                }
                CursorAction::Record { shard, id } => {
                    let shard = topology.shard(*shard)?;
                    outbox.record_cursor(&kit(), shard.as_ref(), *id).await?;
                    println!("shard {} cursor -> {}", shard.id(), id);
                    Ok(())
                }
            }
        }
        Commands::Events {
            shard,
            after,
            consumed,
            limit,
        } => {
            let outbox = EventOutbox::new(ids);
            let shard = topology.shard(*shard)?;
            let page = Page::new(0, *limit);
            let rows = if *consumed {
                let cursor = outbox.latest_cursor(&kit(), shard.as_ref()).await?;
                outbox
                    .list_consumed_events(&kit(), shard.as_ref(), cursor, page)
                    .await?
            } else {
                outbox.list(&kit(), shard.as_ref(), *after, page).await?
            };
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
            Ok(())
        }
        Commands::Purge { days } => {
            let settings = OutboxMaintenance {
                retention_days: *days,
                ..OutboxMaintenance::default()
            };
            let report = settings
                .purge_all(&EventOutbox::new(ids), &topology.resolver.all())
                .await;
            println!(
                "purged {} events on {} shards ({} failed)",
                report.affected, report.shards, report.failed_shards
            );
            Ok(())
        }
        Commands::Sweep { stale_after } => {
            let settings = OutboxMaintenance {
                stale_after: Duration::from_secs(*stale_after),
                ..OutboxMaintenance::default()
            };
            let report = settings
                .sweep_all(&EventOutbox::new(ids), &topology.resolver.all())
                .await;
            println!(
                "failed {} stale events on {} shards ({} failed)",
                report.affected, report.shards, report.failed_shards
            );
            Ok(())
        }
    }
}

async fn cmd_migrate(topology: &Topology) -> Result<()> {
    let mut migrated = 0;
    for shard in topology.databases() {
        init_schema(shard.pool())
            .await
            .with_context(|| format!("Failed to migrate shard {}", shard.id()))?;
        migrated += 1;
    }
    seed_counters(topology.admin.as_ref())
        .await
        .context("Failed to seed id counters")?;
    info!(shards = migrated, "migration complete");
    Ok(())
}

async fn cmd_serve(
    topology: &Topology,
    outbox: &EventOutbox,
    settings: OutboxMaintenance,
) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
        }
        let _ = stop_tx.send(true);
    });

    settings
        .run(outbox, &topology.resolver.all(), stop_rx)
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_shard_list() {
        let cli = Cli::try_parse_from([
            "cfgplaned",
            "--shard-url",
            "postgres://a/db,postgres://b/db",
            "events",
            "--shard",
            "2",
            "--consumed",
        ])
        .unwrap();
        assert_eq!(cli.shard_urls.len(), 2);
        assert!(matches!(
            cli.command,
            Commands::Events {
                shard: Some(2),
                consumed: true,
                ..
            }
        ));
    }

    #[test]
    fn serve_flags_map_to_settings() {
        let cli = Cli::try_parse_from([
            "cfgplaned",
            "serve",
            "--retention-days",
            "3",
            "--sweep-every",
            "10",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let settings = args.settings();
        assert_eq!(settings.retention_days, 3);
        assert_eq!(settings.sweep_every, Duration::from_secs(10));
        assert_eq!(settings.purge_every, Duration::from_secs(3600));
    }

    #[test]
    fn consumed_listing_rejects_after() {
        let parsed = Cli::try_parse_from(["cfgplaned", "events", "--consumed", "--after", "5"]);
        assert!(parsed.is_err());
    }

    fn single_database_cli() -> Cli {
        Cli::try_parse_from([
            "cfgplaned",
            "--db-url",
            "postgres://postgres@localhost:5432/cfgplane",
            "migrate",
        ])
        .unwrap()
    }

    fn same_shard(a: &Arc<dyn Shard>, b: &Arc<PgShard>) -> bool {
        Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
    }

    #[tokio::test]
    async fn single_database_keeps_a_separate_admin_pool() {
        let mut cli = single_database_cli();
        cli.shard_urls.clear();
        let topology = Topology::connect(&cli).unwrap();

        assert_eq!(topology.tenants.len(), 1);
        assert!(!Arc::ptr_eq(&topology.tenants[0], &topology.admin));
        assert!(same_shard(&topology.resolver.admin(), &topology.admin));
        assert!(same_shard(&topology.resolver.sharding_one(7), &topology.tenants[0]));
        // One database, migrated once.
        assert_eq!(topology.databases().count(), 1);
        assert_eq!(topology.resolver.all().len(), 1);
    }

    #[tokio::test]
    async fn unnamed_shard_is_the_first_tenant() {
        let mut cli = single_database_cli();
        cli.shard_urls = vec![
            "postgres://postgres@localhost:5432/tenant_a".to_string(),
            "postgres://postgres@localhost:5432/tenant_b".to_string(),
        ];
        let topology = Topology::connect(&cli).unwrap();

        assert_eq!(topology.shard(None).unwrap().id(), 1);
        assert_eq!(topology.shard(Some(0)).unwrap().id(), 0);
        assert!(topology.shard(Some(5)).is_err());
        assert_eq!(topology.databases().count(), 3);
    }
}
