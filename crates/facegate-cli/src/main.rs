use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use facegate_core::{FaceModelKind, PersonId};
use facegate_service::{
    spawn_engine, GateConfig, Gender, MatchPolicy, NullNotifier, NullSink, PersonProfile,
    PolicyUpdate, RegisterError, RegistrationGate, SettingsRegistry,
};
use facegate_store::{Corpus, EmbeddingCipher, PhotoVault, SqliteCorpus};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate biometric registration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from a photo
    Register {
        /// Path to the photo file
        #[arg(short, long)]
        image: PathBuf,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: String,
        /// female | male | other
        #[arg(long, default_value = "other")]
        gender: String,
        /// Date of birth, YYYY-MM-DD
        #[arg(long)]
        date_of_birth: String,
        #[arg(long, default_value = "cedula")]
        id_number_type: String,
        #[arg(long)]
        id_number: String,
        /// Confirm the person accepted the terms and conditions
        #[arg(long)]
        accept_terms: bool,
    },
    /// List registered people
    List,
    /// Remove a person's biometric record and stored photo
    Remove {
        /// Person id to remove
        person: String,
    },
    /// Inspect or change the match policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Show gate status
    Status,
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Print the active policy
    Get,
    /// Update model and/or threshold (threshold 0 resets to the model default)
    Set {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        threshold: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = GateConfig::load()?;

    match cli.command {
        Commands::Register {
            image,
            first_name,
            last_name,
            email,
            phone,
            gender,
            date_of_birth,
            id_number_type,
            id_number,
            accept_terms,
        } => {
            let profile = PersonProfile {
                first_name,
                last_name,
                email,
                phone,
                gender: parse_gender(&gender)?,
                date_of_birth: NaiveDate::parse_from_str(&date_of_birth, "%Y-%m-%d")
                    .context("date of birth must be YYYY-MM-DD")?,
                id_number_type,
                id_number,
                accepted_terms: accept_terms,
            };
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;

            let gate = open_gate(&config).await?;
            match gate.register(profile, bytes).await {
                Ok(person) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "status": "committed",
                            "person_id": person.to_string(),
                        })
                    );
                }
                Err(RegisterError::DuplicateFace { person, similarity }) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "status": "rejected",
                            "matched_person": person.to_string(),
                            "similarity": similarity,
                        })
                    );
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::List => {
            let corpus = open_corpus(&config).await?;
            let records = corpus.all().await?;
            let rows: Vec<_> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "person_id": r.person.to_string(),
                        "model": r.embedding.model.as_str(),
                        "dim": r.embedding.values.len(),
                        "artifact_sha256": r.artifact_sha256,
                        "created_at": r.created_at.to_rfc3339(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }

        Commands::Remove { person } => {
            let person = PersonId(person.parse().context("invalid person id")?);
            let corpus = open_corpus(&config).await?;
            let vault = PhotoVault::open(&config.vault_dir).await?;

            let removed = corpus.remove(person).await?;
            let photo_removed = vault.remove(person).await?;
            println!(
                "{}",
                serde_json::json!({
                    "removed": removed,
                    "photo_removed": photo_removed,
                })
            );
        }

        Commands::Policy { command } => match command {
            PolicyCommands::Get => {
                print_policy(&load_policy(&config));
            }
            PolicyCommands::Set { model, threshold } => {
                let model = model
                    .map(|m| m.parse::<FaceModelKind>())
                    .transpose()?;
                let policy =
                    PolicyUpdate { model, threshold }.apply_to(load_policy(&config))?;
                save_policy(&config, &policy)?;
                print_policy(&policy);
            }
        },

        Commands::Status => {
            let corpus = open_corpus(&config).await?;
            let vault = PhotoVault::open(&config.vault_dir).await?;
            let records = corpus.all().await?;

            let mut intact = 0usize;
            for r in &records {
                if vault.verify(r.person, &r.artifact_sha256).await? {
                    intact += 1;
                }
            }

            let policy = load_policy(&config);
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "registered": records.len(),
                    "artifacts_intact": intact,
                    "model": policy.model.as_str(),
                    "threshold": policy.effective_threshold(),
                    "db_path": config.db_path.display().to_string(),
                    "model_dir": config.model_dir.display().to_string(),
                })
            );
        }
    }

    Ok(())
}

async fn open_gate(config: &GateConfig) -> Result<RegistrationGate> {
    let engine = spawn_engine(&config.model_dir, config.engine_queue)?;
    let corpus = Arc::new(open_corpus(config).await?);
    let vault = PhotoVault::open(&config.vault_dir).await?;
    let settings = Arc::new(SettingsRegistry::new(load_policy(config)));
    Ok(RegistrationGate::new(
        Arc::new(engine),
        settings,
        corpus,
        vault,
        Arc::new(NullSink),
        Arc::new(NullNotifier),
    ))
}

async fn open_corpus(config: &GateConfig) -> Result<SqliteCorpus> {
    let cipher = EmbeddingCipher::from_passphrase(&config.passphrase);
    Ok(SqliteCorpus::open(&config.db_path, cipher).await?)
}

fn parse_gender(s: &str) -> Result<Gender> {
    match s {
        "female" => Ok(Gender::Female),
        "male" => Ok(Gender::Male),
        "other" => Ok(Gender::Other),
        _ => anyhow::bail!("gender must be female, male or other"),
    }
}

/// Operator policy changes persist next to the database so they survive
/// across CLI runs.
fn policy_path(config: &GateConfig) -> PathBuf {
    config.db_path.with_file_name("policy.json")
}

fn load_policy(config: &GateConfig) -> MatchPolicy {
    let path = policy_path(config);
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "unreadable policy file; falling back to configured policy"
                );
                config.initial_policy()
            }
        },
        Err(_) => config.initial_policy(),
    }
}

fn save_policy(config: &GateConfig, policy: &MatchPolicy) -> Result<()> {
    let path = policy_path(config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(policy)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn print_policy(policy: &MatchPolicy) {
    println!(
        "{}",
        serde_json::json!({
            "model": policy.model.as_str(),
            "threshold": policy.effective_threshold(),
            "explicit": policy.threshold.is_some(),
        })
    );
}
