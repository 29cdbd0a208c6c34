//! `xrdadmin` command line: one subcommand per admin operation, config
//! from a file, environment and flags.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::client::AdminClient;
use crate::config::AdminConfig;
use xrdadmin_transport::message::QueryCode;

use crate::types::{BatchResult, MkdirFlags, PermissionTriple, PrepareFlags, PrepareReceipt, Priority};

/// Parsed command line.
#[derive(Parser)]
#[command(name = "xrdadmin")]
#[command(about = "Administrative client for redirector-based storage clusters", long_about = None)]
pub struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, env = "XRDADMIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Entry redirector `host:port`; repeat for fallbacks.
    #[arg(short, long = "redirector", env = "XRDADMIN_REDIRECTOR", value_delimiter = ',')]
    pub redirectors: Vec<String>,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Concurrent requests per batch.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Log as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Admin operations.
#[derive(Subcommand)]
pub enum Command {
    /// Show the status of a path.
    Stat {
        /// Logical path.
        path: String,
    },
    /// List a directory.
    Ls {
        /// Directory to list.
        path: String,
        /// Show size, type and residency of every entry.
        #[arg(short, long)]
        long: bool,
    },
    /// Show free space available for a path.
    Statvfs {
        /// Logical path.
        path: String,
    },
    /// Create a directory.
    Mkdir {
        /// Directory to create.
        path: String,
        /// Create missing parents.
        #[arg(short, long)]
        parents: bool,
        /// Octal permission mode.
        #[arg(short, long, default_value = "755")]
        mode: String,
    },
    /// Remove a file.
    Rm {
        /// File to remove.
        path: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Directory to remove.
        path: String,
    },
    /// Rename a file or directory.
    Mv {
        /// Existing path.
        source: String,
        /// New path; must not exist.
        destination: String,
    },
    /// Change permissions, e.g. `chmod 750 /store/run1`.
    Chmod {
        /// Octal permission mode.
        mode: String,
        /// Logical path.
        path: String,
    },
    /// Truncate a file.
    Truncate {
        /// File to truncate.
        path: String,
        /// New size in bytes.
        size: u64,
    },
    /// Show where a path is served from.
    Locate {
        /// Logical path.
        path: String,
        /// Report every data server holding the path.
        #[arg(short, long)]
        all: bool,
    },
    /// Check that paths are existing files.
    Exists {
        /// Paths to check.
        paths: Vec<String>,
    },
    /// Check that paths are existing directories.
    Existdirs {
        /// Paths to check.
        paths: Vec<String>,
    },
    /// Check that files are online.
    Online {
        /// Paths to check.
        paths: Vec<String>,
    },
    /// Queue files for staging.
    Prepare(PrepareArgs),
    /// Show the progress of a staging request.
    PrepareStatus {
        /// Request id printed by `prepare`.
        request_id: String,
    },
    /// Print the checksum of a file.
    Checksum {
        /// File to checksum.
        path: String,
    },
    /// Send a raw query: config, space, stats, prepare, xattr, checksum,
    /// checksum-cancel, opaque, opaque-file or visa.
    Query {
        /// Query kind.
        code: String,
        /// Query argument; a logical path for file queries.
        #[arg(default_value = "")]
        arg: String,
    },
    /// Show the protocol version and role of the entry redirector.
    Protocol,
    /// Measure the round trip to the entry redirector.
    Ping,
}

/// Options of `prepare`.
#[derive(Args)]
pub struct PrepareArgs {
    /// Files to stage.
    pub paths: Vec<String>,
    /// 0 (low) to 3 (urgent).
    #[arg(short, long, default_value_t = 0)]
    pub priority: u8,
    /// Bring the files online.
    #[arg(long)]
    pub stage: bool,
    /// Files will be opened for writing.
    #[arg(long)]
    pub write: bool,
    /// Stage all files on one server.
    #[arg(long)]
    pub colocate: bool,
    /// Refresh the cluster's view of the files first.
    #[arg(long)]
    pub fresh: bool,
    /// Ask for a notification when done.
    #[arg(long)]
    pub notify: bool,
    /// Cancel an earlier request for the files.
    #[arg(long)]
    pub cancel: bool,
}

impl PrepareArgs {
    fn flags(&self) -> PrepareFlags {
        [
            (self.stage, PrepareFlags::STAGE),
            (self.write, PrepareFlags::WRITE_MODE),
            (self.colocate, PrepareFlags::COLOCATE),
            (self.fresh, PrepareFlags::FRESH),
            (self.notify, PrepareFlags::NOTIFY),
            (self.cancel, PrepareFlags::CANCEL),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(PrepareFlags::empty(), |acc, (_, flag)| acc | flag)
    }
}

fn parse_mode(mode: &str) -> Result<PermissionTriple> {
    let bits = u16::from_str_radix(mode, 8).with_context(|| format!("invalid octal mode '{}'", mode))?;
    Ok(PermissionTriple::from_mode(bits)?)
}

fn parse_query_code(code: &str) -> Result<QueryCode> {
    let parsed = match code.to_ascii_lowercase().as_str() {
        "config" => QueryCode::Config,
        "checksum" => QueryCode::Checksum,
        "checksum-cancel" => QueryCode::ChecksumCancel,
        "opaque" => QueryCode::Opaque,
        "opaque-file" => QueryCode::OpaqueFile,
        "prepare" => QueryCode::Prepare,
        "space" => QueryCode::Space,
        "stats" => QueryCode::Stats,
        "visa" => QueryCode::Visa,
        "xattr" => QueryCode::XAttr,
        other => anyhow::bail!("unknown query kind '{}'", other),
    };
    Ok(parsed)
}

fn print_flags(paths: &[String], result: &BatchResult<bool>) {
    for (path, outcome) in paths.iter().zip(result.iter()) {
        match outcome {
            Ok(flag) => println!("{}\t{}", path, flag),
            Err(e) => println!("{}\terror: {}", path, e),
        }
    }
}

impl Cli {
    /// Effective configuration: defaults, then the config file, then flags.
    pub fn load_config(&self) -> Result<AdminConfig> {
        let mut config = match &self.config {
            Some(path) => AdminConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => AdminConfig::default(),
        };
        if !self.redirectors.is_empty() {
            config.redirectors = self.redirectors.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            config.request_timeout_ms = timeout;
        }
        if let Some(concurrency) = self.concurrency {
            config.batch_concurrency = concurrency;
        }
        config.validate()?;
        Ok(config)
    }

    /// Connects over TCP, runs the subcommand and shuts the client down.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let client = AdminClient::connect_tcp(config).await?;
        let outcome = self.execute(&client).await;
        client.shutdown();
        outcome
    }

    async fn execute(&self, client: &AdminClient) -> Result<()> {
        match &self.command {
            Command::Stat { path } => {
                let status = client.stat(path).await?;
                println!("Path:     {}", path);
                println!("Id:       {}", status.id);
                println!("Size:     {}", status.size);
                println!("Flags:    0x{:x}", status.flags.bits());
                println!("Type:     {}", if status.is_dir() { "directory" } else { "file" });
                println!("Online:   {}", status.is_online());
                println!("Modified: {}", status.mod_time);
            }
            Command::Ls { path, long: false } => {
                let mut listing = client.dirlist(path).await?;
                while let Some(entry) = listing.next().await {
                    println!("{}", entry?);
                }
            }
            Command::Ls { path, long: true } => {
                let mut listing = client.dirlist_with_stat(path).await?;
                while let Some(entry) = listing.next_entry().await {
                    let entry = entry?;
                    match entry.status {
                        Some(status) => println!(
                            "{}\t{:>12}\t{}\t{}",
                            if status.is_dir() { "d" } else { "-" },
                            status.size,
                            if status.is_online() { "online" } else { "offline" },
                            entry.name
                        ),
                        None => println!("{}", entry.name),
                    }
                }
            }
            Command::Statvfs { path } => {
                let space = client.stat_vfs(path).await?;
                println!("RW nodes:        {}", space.nodes_rw);
                println!("RW free (MiB):   {}", space.free_rw_mb);
                println!("RW used:         {}%", space.utilization_rw);
                println!("Staging nodes:   {}", space.nodes_staging);
                println!("Staging free:    {}", space.free_staging_mb);
                println!("Staging used:    {}%", space.utilization_staging);
            }
            Command::Mkdir {
                path,
                parents,
                mode,
            } => {
                let flags = MkdirFlags { make_path: *parents };
                client.mkdir_with(path, parse_mode(mode)?, flags).await?;
            }
            Command::Rm { path } => client.rm(path).await?,
            Command::Rmdir { path } => client.rmdir(path).await?,
            Command::Mv {
                source,
                destination,
            } => client.mv(source, destination).await?,
            Command::Chmod { mode, path } => client.chmod(path, parse_mode(mode)?).await?,
            Command::Truncate { path, size } => client.truncate(path, *size).await?,
            Command::Locate { path, all } => {
                if *all {
                    for location in client.locate_all(path).await? {
                        println!(
                            "{}\t{}\tonline={}\twritable={}",
                            location.server, location.internal_path, location.online, location.writable
                        );
                    }
                } else {
                    let location = client.locate(path).await?;
                    println!("{}\t{}", location.server, location.internal_path);
                }
            }
            Command::Exists { paths } => print_flags(paths, &client.existfiles(paths).await?),
            Command::Existdirs { paths } => print_flags(paths, &client.existdirs(paths).await?),
            Command::Online { paths } => print_flags(paths, &client.isfileonline(paths).await?),
            Command::Prepare(args) => {
                let priority = Priority::try_from(args.priority)?;
                let receipt = client.prepare(&args.paths, args.flags(), priority).await?;
                println!("{}", receipt.request_id);
            }
            Command::PrepareStatus { request_id } => {
                let receipt = PrepareReceipt {
                    request_id: request_id.clone(),
                };
                let status = client.prepare_status(&receipt).await?;
                for file in &status.files {
                    println!("{}\t{}", file.state, file.path);
                }
            }
            Command::Query { code, arg } => {
                let response = client.query(parse_query_code(code)?, arg).await?;
                println!("{}", response);
            }
            Command::Checksum { path } => {
                let record = client.checksum_record(path).await?;
                println!("{} {} {}", record.algorithm, record.digest, record.path);
            }
            Command::Protocol => {
                let info = client.protocol().await?;
                println!("Version: {}", info.version);
                println!("Role:    {}", info.role);
            }
            Command::Ping => {
                let rtt = client.ping().await?;
                println!("{} us", rtt.as_micros());
            }
        }
        Ok(())
    }
}
