use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use polar_router::config::{
    DedupeConfig, MeshConfig, PlannerConfig, RetentionConfig, ServerConfig, WorkerConfig,
};
use polar_router::mesh::MeshCatalog;
use polar_router::node::Node;
use polar_router::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "polar-router")]
#[command(version)]
#[command(about = "Asynchronous polar ship-route computation service")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the routing service
    Server(ServerArgs),

    /// Inspect the mesh directory
    Meshes {
        /// Directory holding mesh payloads and their .meta.json sidecars
        #[arg(long, default_value = "meshes")]
        mesh_dir: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Directory holding mesh payloads and their .meta.json sidecars
    #[arg(long, default_value = "meshes")]
    mesh_dir: PathBuf,

    /// Persist jobs to this JSON file (in-memory when omitted)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Attempts per job before a timeout or worker error becomes final
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Maximum seconds for one route computation
    #[arg(long, default_value = "300")]
    compute_timeout_secs: u64,

    /// Seconds a claimed job stays hidden from other workers
    #[arg(long, default_value = "360")]
    visibility_timeout_secs: u64,

    /// Maximum meshes kept in memory
    #[arg(long, default_value = "4")]
    max_cached_meshes: usize,

    /// Memory budget for cached meshes in MiB
    #[arg(long, default_value = "2048")]
    mesh_cache_mib: usize,

    /// Seconds between mesh directory rescans (0 disables)
    #[arg(long, default_value = "300")]
    mesh_refresh_secs: u64,

    /// Hours a completed route is reused for identical requests
    #[arg(long, default_value = "6")]
    reuse_window_hours: u64,

    /// Reuse a finished route whose endpoints are within this many nautical miles (0 disables)
    #[arg(long, default_value = "0")]
    waypoint_tolerance_nm: f64,

    /// Purge finished jobs older than this many hours
    #[arg(long)]
    job_ttl_hours: Option<u64>,

    /// Evict meshes unused for this many minutes
    #[arg(long)]
    mesh_idle_minutes: Option<u64>,

    /// Refuse new jobs once the store holds this many (unbounded when omitted)
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Vessel speed used by the planner
    #[arg(long, default_value = "12")]
    speed_knots: f64,

    /// Fuel burn used by the planner
    #[arg(long, default_value = "24")]
    fuel_tonnes_per_day: f64,
}

impl ServerArgs {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let listen_addr: SocketAddr = format!("{}:{}", self.bind, self.port).parse()?;
        let planner = PlannerConfig {
            speed_knots: self.speed_knots,
            fuel_tonnes_per_day: self.fuel_tonnes_per_day,
            ..PlannerConfig::default()
        };

        Ok(ServerConfig {
            listen_addr,
            store_path: self.store,
            worker: WorkerConfig::default()
                .with_workers(self.workers)
                .with_max_attempts(self.max_attempts)
                .with_timeouts(
                    Duration::from_secs(self.compute_timeout_secs),
                    Duration::from_secs(self.visibility_timeout_secs),
                ),
            mesh: MeshConfig {
                dir: self.mesh_dir,
                max_cached: self.max_cached_meshes,
                max_cache_bytes: self.mesh_cache_mib.saturating_mul(1024 * 1024),
                refresh_interval: (self.mesh_refresh_secs > 0)
                    .then(|| Duration::from_secs(self.mesh_refresh_secs)),
            },
            dedupe: DedupeConfig {
                reuse_window: Duration::from_secs(self.reuse_window_hours.saturating_mul(3600)),
                waypoint_tolerance_nm: self.waypoint_tolerance_nm,
            },
            retention: RetentionConfig {
                completed_job_ttl: self
                    .job_ttl_hours
                    .map(|h| Duration::from_secs(h.saturating_mul(3600))),
                mesh_idle_ttl: self
                    .mesh_idle_minutes
                    .map(|m| Duration::from_secs(m.saturating_mul(60))),
                max_jobs: self.max_jobs,
                ..RetentionConfig::default()
            },
            planner,
        })
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct MeshOutput {
    id: String,
    file: String,
    created: String,
    valid_from: String,
    valid_until: String,
    bounds: [f64; 4],
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config()?;
    tracing::info!(
        addr = %config.listen_addr,
        mesh_dir = %config.mesh.dir.display(),
        workers = config.worker.workers,
        max_attempts = config.worker.max_attempts,
        "Starting polar-router"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config).await?;
    node.run(shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Mesh Commands
// =============================================================================

async fn handle_meshes(mesh_dir: PathBuf, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let meshes = MeshCatalog::scan_dir(&mesh_dir).await?;

    match output {
        OutputFormat::Json => {
            let out: Vec<MeshOutput> = meshes
                .iter()
                .map(|m| MeshOutput {
                    id: m.id.clone(),
                    file: m.file.display().to_string(),
                    created: m.created.to_rfc3339(),
                    valid_from: m.valid_from.to_rfc3339(),
                    valid_until: m.valid_until.to_rfc3339(),
                    bounds: [m.bounds.lat_min, m.bounds.lat_max, m.bounds.lon_min, m.bounds.lon_max],
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if meshes.is_empty() {
                println!("No meshes found in {}", mesh_dir.display());
                return Ok(());
            }
            println!(
                "{:<24} {:<20} {:<23} {:<34}",
                "MESH", "CREATED", "VALID", "BOUNDS (lat / lon)"
            );
            for m in &meshes {
                println!(
                    "{:<24} {:<20} {:<23} {:<34}",
                    m.id,
                    m.created.format("%Y-%m-%d %H:%M"),
                    format!("{} .. {}", m.valid_from.format("%Y-%m-%d"), m.valid_until.format("%Y-%m-%d")),
                    format!(
                        "{:.1}..{:.1} / {:.1}..{:.1}",
                        m.bounds.lat_min, m.bounds.lat_max, m.bounds.lon_min, m.bounds.lon_max
                    ),
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Meshes { mesh_dir, output } => {
            handle_meshes(mesh_dir, &output).await?;
        }
    }

    Ok(())
}
