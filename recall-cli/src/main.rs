//! recall-cli: command-line client for the recall daemon.
//!
//! Speaks the daemon's framed MessagePack protocol over its Unix socket and
//! prints the `data` of each response as JSON.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use recall_core::ipc::{RecallRequest, RecallResponse};
use recall_core::OrphanPolicy;

const DEFAULT_SOCKET: &str = "/tmp/recall.sock";
const DEFAULT_LIMIT: usize = 5;
const MAX_FRAME: usize = 64 * 1024 * 1024;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "recall-cli", version, about = "Client for the recall vector store")]
struct Cli {
    /// Daemon socket path (overrides RECALL_SOCKET env var)
    #[arg(long, env = "RECALL_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: String,

    /// Print the whole response envelope instead of just its data
    #[arg(long)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check the daemon is answering
    Ping,
    /// Database and index health
    Health,
    /// Store an embedding with its metadata
    Add {
        /// Comma-separated components, e.g. "0.1,0.2,0.3"
        #[arg(long)]
        vector: String,
        /// Metadata as a JSON object
        #[arg(long)]
        metadata: String,
    },
    /// Nearest neighbours of a query vector
    Search {
        #[arg(long)]
        vector: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Metadata stored for one id
    Get { id: String },
    /// Replace the embedding and metadata of an existing id
    Update {
        id: String,
        #[arg(long)]
        vector: String,
        #[arg(long)]
        metadata: String,
    },
    /// Remove an id from both stores
    Delete { id: String },
    /// Number of stored records
    Count,
    /// Write a backup (defaults to the daemon's configured dir)
    Backup {
        #[arg(long)]
        dir: Option<String>,
    },
    /// Replace the store with a backup
    Restore { path: String },
    /// List backups, newest first
    Backups {
        #[arg(long)]
        dir: Option<String>,
    },
    /// Compact the database
    Vacuum,
    /// Repair ids present in only one store
    Reconcile {
        /// "delete" or "backfill"; daemon default when omitted
        #[arg(long)]
        policy: Option<String>,
    },
    /// Drop the index query cache and the metadata cache
    ClearCaches,
    /// Store metrics
    Metrics,
    /// Current hardware readings
    Hardware,
    /// Temperature and usage readings kept by the daemon
    HardwareHistory {
        /// Only the newest N samples
        #[arg(long)]
        limit: Option<usize>,
    },
}

// ============================================================================
// Request building
// ============================================================================

/// Parse "0.1, 0.2,0.3" into a single-row embedding.
fn parse_vector(raw: &str) -> anyhow::Result<Vec<Vec<f32>>> {
    let row = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .with_context(|| format!("invalid vector component '{}'", s))
        })
        .collect::<anyhow::Result<Vec<f32>>>()?;
    if row.is_empty() {
        bail!("vector must have at least one component");
    }
    Ok(vec![row])
}

fn parse_metadata(raw: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(raw).context("metadata is not valid JSON")
}

fn parse_policy(raw: &str) -> anyhow::Result<OrphanPolicy> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .with_context(|| format!("unknown orphan policy '{}'", raw))
}

fn build_request(command: Commands) -> anyhow::Result<RecallRequest> {
    let request = match command {
        Commands::Ping => RecallRequest::Ping,
        Commands::Health => RecallRequest::Health,
        Commands::Add { vector, metadata } => RecallRequest::Add {
            embedding: parse_vector(&vector)?,
            metadata: parse_metadata(&metadata)?,
        },
        Commands::Search { vector, limit } => RecallRequest::Search {
            embedding: parse_vector(&vector)?,
            n_results: limit,
        },
        Commands::Get { id } => RecallRequest::Get { id },
        Commands::Update {
            id,
            vector,
            metadata,
        } => RecallRequest::Update {
            id,
            embedding: parse_vector(&vector)?,
            metadata: parse_metadata(&metadata)?,
        },
        Commands::Delete { id } => RecallRequest::Delete { id },
        Commands::Count => RecallRequest::Count,
        Commands::Backup { dir } => RecallRequest::Backup { dir },
        Commands::Restore { path } => RecallRequest::Restore { path },
        Commands::Backups { dir } => RecallRequest::ListBackups { dir },
        Commands::Vacuum => RecallRequest::Vacuum,
        Commands::Reconcile { policy } => RecallRequest::Reconcile {
            policy: policy.as_deref().map(parse_policy).transpose()?,
        },
        Commands::ClearCaches => RecallRequest::ClearCaches,
        Commands::Metrics => RecallRequest::Metrics,
        Commands::Hardware => RecallRequest::Hardware,
        Commands::HardwareHistory { limit } => RecallRequest::HardwareHistory { limit },
    };
    Ok(request)
}

// ============================================================================
// Framing
// ============================================================================

/// Write one 4-byte little-endian length prefix followed by the payload.
fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    let len = u32::try_from(payload.len()).context("request too large")?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

fn read_frame<R: Read>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .context("connection closed before a response arrived")?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        bail!("response frame of {} bytes exceeds limit", len);
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

fn send_request(socket: &str, request: &RecallRequest) -> anyhow::Result<RecallResponse> {
    let mut stream = match UnixStream::connect(socket) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("recall-cli: cannot connect to {}: {}", socket, e);
            std::process::exit(1);
        }
    };
    // restore and backup can take a while on large stores
    stream.set_read_timeout(Some(Duration::from_secs(300)))?;

    let payload = rmp_serde::to_vec_named(request)?;
    write_frame(&mut stream, &payload)?;
    let frame = read_frame(&mut stream)?;
    let response: RecallResponse =
        rmp_serde::from_slice(&frame).context("failed to decode response")?;
    Ok(response)
}

// ============================================================================
// Main
// ============================================================================

fn run(cli: Cli) -> anyhow::Result<()> {
    let request = build_request(cli.command)?;
    let response = send_request(&cli.socket, &request)?;

    if cli.raw {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if let Some(data) = &response.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }

    if !response.is_ok() {
        let code = response.code.as_deref().unwrap_or("-");
        eprintln!(
            "recall-cli: [{}] {}",
            code,
            response.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("recall-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // ========================================================================
    // TEST 1: vectors parse with loose whitespace
    // ========================================================================
    #[test]
    fn test_parse_vector() {
        let parsed = parse_vector(" 0.5, -1,2.25 ").expect("parse");
        assert_eq!(parsed, vec![vec![0.5, -1.0, 2.25]]);

        assert!(parse_vector("").is_err());
        assert!(parse_vector("1.0,abc").is_err());
    }

    // ========================================================================
    // TEST 2: subcommands map onto the daemon's requests
    // ========================================================================
    #[test]
    fn test_build_request() {
        let cli = Cli::try_parse_from([
            "recall-cli",
            "search",
            "--vector",
            "1,0",
            "-n",
            "3",
        ])
        .expect("parse args");
        match build_request(cli.command).expect("request") {
            RecallRequest::Search {
                embedding,
                n_results,
            } => {
                assert_eq!(embedding, vec![vec![1.0, 0.0]]);
                assert_eq!(n_results, 3);
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let cli = Cli::try_parse_from(["recall-cli", "reconcile", "--policy", "Backfill"])
            .expect("parse args");
        assert!(matches!(
            build_request(cli.command).expect("request"),
            RecallRequest::Reconcile {
                policy: Some(OrphanPolicy::Backfill)
            }
        ));

        let cli = Cli::try_parse_from(["recall-cli", "reconcile", "--policy", "shred"])
            .expect("parse args");
        assert!(build_request(cli.command).is_err());

        let cli = Cli::try_parse_from(["recall-cli", "hardware-history", "--limit", "10"])
            .expect("parse args");
        assert!(matches!(
            build_request(cli.command).expect("request"),
            RecallRequest::HardwareHistory { limit: Some(10) }
        ));
    }

    // ========================================================================
    // TEST 3: add requires JSON metadata
    // ========================================================================
    #[test]
    fn test_add_rejects_bad_metadata() {
        let cli = Cli::try_parse_from([
            "recall-cli",
            "add",
            "--vector",
            "1",
            "--metadata",
            "{not json",
        ])
        .expect("parse args");
        assert!(build_request(cli.command).is_err());
    }

    // ========================================================================
    // TEST 4: frames carry a little-endian length prefix
    // ========================================================================
    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").expect("write");
        assert_eq!(&buf[..4], &[5, 0, 0, 0]);

        let payload = read_frame(&mut Cursor::new(buf)).expect("read");
        assert_eq!(payload, b"hello");

        let truncated = vec![9u8, 0, 0, 0, 1, 2];
        assert!(read_frame(&mut Cursor::new(truncated)).is_err());
    }

    // ========================================================================
    // TEST 5: a request encodes as a named MessagePack map
    // ========================================================================
    #[test]
    fn test_request_encoding_is_named() {
        let bytes = rmp_serde::to_vec_named(&RecallRequest::Get {
            id: "vec_1".to_string(),
        })
        .expect("encode");
        let decoded: serde_json::Value = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(decoded["action"], "get");
        assert_eq!(decoded["id"], "vec_1");
    }
}
