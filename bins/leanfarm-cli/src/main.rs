mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use commands::{Operator, SubmitRequest};

#[derive(Parser)]
#[command(name = "leanfarm-cli")]
#[command(about = "Lean Farm CLI - Submit proof-checking jobs and inspect the queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a code bundle and enqueue a job that runs it
    Submit {
        /// Bundle file handed to the sandbox read-only
        #[arg(short, long)]
        bundle: PathBuf,

        /// CPU cores requested
        #[arg(long, default_value = "1")]
        cpu: f64,

        /// Memory requested, in bytes
        #[arg(short, long, default_value = "2147483648")]
        memory: u64,

        /// Wall-clock timeout in seconds (defaults to the policy ceiling)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Program and arguments to run inside the sandbox
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print a job record as JSON
    Status {
        job_id: Uuid,
    },

    /// List dead-lettered jobs, most recent first
    DeadLetters {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Move a dead-lettered job back to pending with a fresh attempt budget
    Redrive {
        job_id: Uuid,
    },

    /// Print pending, leased and dead-lettered counts
    Depth,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let operator = Operator::connect().await?;

    match cli.command {
        Commands::Submit {
            bundle,
            cpu,
            memory,
            timeout,
            command,
        } => {
            let bytes = tokio::fs::read(&bundle)
                .await
                .with_context(|| format!("Failed to read bundle {}", bundle.display()))?;
            let job = operator
                .submit(SubmitRequest {
                    bundle: bytes,
                    command,
                    cpu_cores: cpu,
                    memory_bytes: memory,
                    timeout_seconds: timeout,
                })
                .await?;
            println!("{}", job.id);
        }
        Commands::Status { job_id } => {
            commands::print_json(&operator.status(job_id).await?)?;
        }
        Commands::DeadLetters { limit } => {
            commands::print_json(&operator.dead_letters(limit).await?)?;
        }
        Commands::Redrive { job_id } => {
            let job = operator.redrive(job_id).await?;
            println!("Job {} is {} again", job.id, job.status);
        }
        Commands::Depth => {
            commands::print_json(&operator.depth().await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "leanfarm-cli",
            "submit",
            "--bundle",
            "proof.tar",
            "--cpu",
            "2",
            "--timeout",
            "300",
            "--",
            "lake",
            "build",
            "--verbose",
        ])
        .unwrap();

        match cli.command {
            Commands::Submit {
                bundle,
                cpu,
                memory,
                timeout,
                command,
            } => {
                assert_eq!(bundle, PathBuf::from("proof.tar"));
                assert_eq!(cpu, 2.0);
                assert_eq!(memory, 2147483648);
                assert_eq!(timeout, Some(300));
                assert_eq!(command, vec!["lake", "build", "--verbose"]);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_submit_requires_command() {
        assert!(Cli::try_parse_from(["leanfarm-cli", "submit", "--bundle", "proof.tar"]).is_err());
    }

    #[test]
    fn test_status_rejects_malformed_id() {
        assert!(Cli::try_parse_from(["leanfarm-cli", "status", "not-a-uuid"]).is_err());
    }
}
