//! Vigil: a local-first governance plane for autonomous agents.
//!
//! **Vigil is the control plane agents call before acting.** Agents sharing a
//! workspace report an observation each cycle; Vigil advances their
//! behavioral state, returns a verdict (proceed, proceed-with-caution,
//! pause-for-review, halt), and arbitrates peer-reviewed recovery when an
//! agent is paused.
//!
//! # Core pieces
//!
//! - **Dynamics engine**: a pure four-variable continuous state advanced one
//!   timestep per cycle (`plugins::dynamics`).
//! - **Decision policy**: attention-score classification with regime-aware
//!   thresholds and an adaptive sensitivity tuned by a PI controller
//!   (`plugins::policy`).
//! - **State store & leases**: one writer per agent, heartbeat leases with
//!   TTL reclaim, atomic SQLite persistence (`core::lease`, `core::broker`).
//! - **Dialectic coordinator**: the bounded thesis/antithesis/synthesis
//!   negotiation between a paused agent and an independent reviewer
//!   (`plugins::dialectic`).
//! - **Calibration tracker**: confidence vs. eventual ground truth, feeding
//!   the policy's sensitivity — never gating individual decisions
//!   (`plugins::calibration`).
//!
//! # The thin waist
//!
//! All state mutations route through `core::broker::DbBroker` for per-DB
//! write serialization and audit logging (`broker.events.jsonl`). Write
//! calls require a per-agent token issued by `vigil token issue`.
//!
//! The CLI here is thin glue over the library calls; any transport with a
//! synchronous structured-call boundary can host the same surface.

pub mod core;
pub mod plugins;

use crate::core::config::VigilConfig;
use crate::core::error::VigilError;
use crate::core::store::Store;
use crate::core::{auth, db, time};
use crate::plugins::dialectic::SessionKind;
use crate::plugins::govern::Observation;
use crate::plugins::{agents, calibration, dialectic, govern, jobs};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "vigil",
    version = env!("CARGO_PKG_VERSION"),
    about = "Governance plane for autonomous agents"
)]
struct Cli {
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, default_value = "text")]
    format: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a Vigil workspace in the current (or given) directory
    Init {
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },
    /// Issue or rotate an agent's write token
    Token {
        #[clap(subcommand)]
        command: TokenCommand,
    },
    /// Run one governance cycle for an agent
    Update {
        #[clap(long)]
        agent: String,
        #[clap(long)]
        token: String,
        /// Task complexity in [0,1]
        #[clap(long)]
        complexity: Option<f64>,
        /// Comma-separated drift components, e.g. "0.1,-0.3"
        #[clap(long, default_value = "")]
        drift: String,
        #[clap(long)]
        note: Option<String>,
    },
    /// Dialectic review sessions
    Review {
        #[clap(subcommand)]
        command: ReviewCommand,
    },
    /// Calibration quality and backfill
    Calibration {
        #[clap(subcommand)]
        command: CalibrationCommand,
    },
    /// Run due background jobs (lease reaper, backfill, session sweep)
    Jobs {
        /// Ignore cadence and run everything now
        #[clap(long)]
        force: bool,
    },
    /// Aggregate workspace summary
    Status,
    /// Archive an agent record (never deleted, only archived)
    Archive {
        #[clap(long)]
        agent: String,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Issue (or rotate) the write token for an agent
    Issue {
        #[clap(long)]
        agent: String,
    },
}

#[derive(Subcommand, Debug)]
enum ReviewCommand {
    /// Open a review session for a paused agent
    Request {
        #[clap(long)]
        agent: String,
        #[clap(long)]
        token: String,
        #[clap(long)]
        reason: String,
        /// 'recovery' or 'verification'
        #[clap(long, default_value = "recovery")]
        kind: String,
    },
    /// Requester's account and proposed resumption conditions (JSON)
    Thesis {
        #[clap(long)]
        session: String,
        #[clap(long)]
        agent: String,
        #[clap(long)]
        token: String,
        #[clap(long)]
        payload: String,
    },
    /// Reviewer's observed metrics and concerns (JSON)
    Antithesis {
        #[clap(long)]
        session: String,
        #[clap(long)]
        agent: String,
        #[clap(long)]
        token: String,
        #[clap(long)]
        payload: String,
    },
    /// Proposed or accepted synthesis (JSON with 'conditions' or 'accept')
    Synthesis {
        #[clap(long)]
        session: String,
        #[clap(long)]
        agent: String,
        #[clap(long)]
        token: String,
        #[clap(long)]
        payload: String,
    },
    /// Fetch a session and its transcript
    Get {
        #[clap(long)]
        session: String,
    },
}

#[derive(Subcommand, Debug)]
enum CalibrationCommand {
    /// Per-bucket calibration table and expected calibration error
    Report,
    /// Back-fill ground truth for old decisions (bounded batch)
    Backfill,
}

fn parse_drift(raw: &str) -> Result<Vec<f64>, VigilError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|c| {
            c.trim()
                .parse::<f64>()
                .map_err(|_| VigilError::ValidationError(format!("bad drift component '{c}'")))
        })
        .collect()
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, VigilError> {
    serde_json::from_str(raw)
        .map_err(|e| VigilError::ValidationError(format!("payload is not valid JSON: {e}")))
}

fn open_store() -> Result<Store, VigilError> {
    let cwd = std::env::current_dir()?;
    Store::discover(&cwd).ok_or_else(|| {
        VigilError::NotFound(
            "no .vigil workspace found here or above; run `vigil init` first".to_string(),
        )
    })
}

fn emit(format: &str, cmd: &str, value: serde_json::Value, text: impl FnOnce()) {
    if format == "json" {
        let envelope = time::command_envelope(cmd, "ok", value);
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
    } else {
        text();
    }
}

pub fn run() -> Result<(), VigilError> {
    let cli = Cli::parse();
    let format = cli.format.clone();

    match cli.command {
        Command::Init { dir } => {
            let target = match dir {
                Some(d) => d,
                None => std::env::current_dir()?,
            };
            let store = Store::open(&target)?;
            db::initialize_db(&store.root)?;
            let config_path = target.join(".vigil").join("config.toml");
            if !config_path.exists() {
                let defaults = toml::to_string_pretty(&VigilConfig::default())
                    .map_err(|e| VigilError::ValidationError(format!("config render: {e}")))?;
                std::fs::write(&config_path, defaults).map_err(VigilError::IoError)?;
            }
            println!(
                "{} workspace initialized at {}",
                "✓".bright_green(),
                store.root.display()
            );
            Ok(())
        }
        Command::Token { command } => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            match command {
                TokenCommand::Issue { agent } => {
                    let token = auth::issue_token(&store, &agent)?;
                    emit(
                        &format,
                        "token.issue",
                        serde_json::json!({ "agent": agent, "token": token }),
                        || {
                            println!("Token for {}: {}", agent.bright_white(), token);
                            println!("  (shown once; only the digest is stored)");
                        },
                    );
                    Ok(())
                }
            }
        }
        Command::Update {
            agent,
            token,
            complexity,
            drift,
            note,
        } => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            let cfg = workspace_config(&store)?;
            let observation = Observation {
                drift: parse_drift(&drift)?,
                note,
            };
            let report = govern::update(&store, &cfg, &agent, &token, &observation, complexity)?;
            let value = serde_json::to_value(&report)
                .map_err(|e| VigilError::ValidationError(format!("report serialize: {e}")))?;
            emit(&format, "update", value, || print_report(&report));
            Ok(())
        }
        Command::Review { command } => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            let cfg = workspace_config(&store)?;
            run_review(&store, &cfg, &format, command)
        }
        Command::Calibration { command } => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            let cfg = workspace_config(&store)?;
            match command {
                CalibrationCommand::Report => {
                    let report = calibration::report(&store)?;
                    let value = serde_json::to_value(&report)
                        .map_err(|e| VigilError::ValidationError(e.to_string()))?;
                    emit(&format, "calibration.report", value, || {
                        println!("Calibration (ECE {:.3}):", report.ece);
                        for b in &report.buckets {
                            println!(
                                "  bucket {}: confidence {:.2} vs accuracy {:.2} (weight {:.1})",
                                b.bucket, b.mean_confidence, b.accuracy, b.weight
                            );
                        }
                    });
                    Ok(())
                }
                CalibrationCommand::Backfill => {
                    let report = calibration::backfill(&store, &cfg)?;
                    emit(
                        &format,
                        "calibration.backfill",
                        serde_json::json!({ "scanned": report.scanned, "filled": report.filled }),
                        || println!("Scanned {}, back-filled {}", report.scanned, report.filled),
                    );
                    Ok(())
                }
            }
        }
        Command::Jobs { force } => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            let cfg = workspace_config(&store)?;
            let reports = jobs::run_due(&store, &cfg, force)?;
            let value = serde_json::to_value(&reports)
                .map_err(|e| VigilError::ValidationError(e.to_string()))?;
            emit(&format, "jobs.run", serde_json::json!({ "jobs": value }), || {
                for r in &reports {
                    let mark = if r.ran { "✓".bright_green() } else { "·".bright_black() };
                    println!("{} {}: {}", mark, r.job, r.detail);
                }
            });
            Ok(())
        }
        Command::Status => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            let summary = govern::status(&store)?;
            let value = serde_json::to_value(&summary)
                .map_err(|e| VigilError::ValidationError(e.to_string()))?;
            emit(&format, "status", value, || {
                println!("Agents: {}", summary.agents);
                for (status, n) in &summary.by_status {
                    println!("  {status}: {n}");
                }
                println!("Active sessions: {}", summary.active_sessions);
                for alert in &summary.alerts {
                    println!("{} {}", "⚠".bright_yellow(), alert);
                }
            });
            Ok(())
        }
        Command::Archive { agent } => {
            let store = open_store()?;
            db::initialize_db(&store.root)?;
            agents::archive(&store, &agent)?;
            emit(
                &format,
                "archive",
                serde_json::json!({ "agent": agent }),
                || println!("Archived agent {agent}"),
            );
            Ok(())
        }
    }
}

fn workspace_config(store: &Store) -> Result<VigilConfig, VigilError> {
    // Data root is <workspace>/.vigil/data; config sits beside it.
    let workspace = store
        .root
        .parent()
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| store.root.clone());
    VigilConfig::load(&workspace)
}

fn run_review(
    store: &Store,
    cfg: &VigilConfig,
    format: &str,
    command: ReviewCommand,
) -> Result<(), VigilError> {
    match command {
        ReviewCommand::Request {
            agent,
            token,
            reason,
            kind,
        } => {
            let kind = SessionKind::parse(&kind);
            let session = dialectic::request_review(store, cfg, &agent, &token, &reason, kind)?;
            let value = serde_json::to_value(&session)
                .map_err(|e| VigilError::ValidationError(e.to_string()))?;
            emit(format, "review.request", value, || {
                println!("Session {} opened ({})", session.id, session.phase);
                match (&session.reviewer_id, session.self_recovery) {
                    (Some(r), _) => println!("  reviewer: {r}"),
                    (None, true) => println!("  no eligible reviewer; self-recovery mode"),
                    _ => {}
                }
            });
            Ok(())
        }
        ReviewCommand::Thesis {
            session,
            agent,
            token,
            payload,
        } => {
            let ack =
                dialectic::submit_thesis(store, &session, &agent, &token, parse_payload(&payload)?)?;
            print_ack(format, "review.thesis", &ack);
            Ok(())
        }
        ReviewCommand::Antithesis {
            session,
            agent,
            token,
            payload,
        } => {
            let ack = dialectic::submit_antithesis(
                store,
                &session,
                &agent,
                &token,
                parse_payload(&payload)?,
            )?;
            print_ack(format, "review.antithesis", &ack);
            Ok(())
        }
        ReviewCommand::Synthesis {
            session,
            agent,
            token,
            payload,
        } => {
            let ack = dialectic::submit_synthesis(
                store,
                cfg,
                &session,
                &agent,
                &token,
                parse_payload(&payload)?,
            )?;
            print_ack(format, "review.synthesis", &ack);
            Ok(())
        }
        ReviewCommand::Get { session } => {
            let (session, transcript) = dialectic::get_session(store, cfg, &session)?;
            let value = serde_json::json!({
                "session": session,
                "transcript": transcript,
            });
            emit(format, "review.get", value, || {
                println!(
                    "Session {}: {} ({}), rounds {}",
                    session.id, session.phase, session.status, session.rounds
                );
                for entry in &transcript {
                    println!("  [{}] {} @ {}", entry.phase, entry.party, entry.ts);
                }
            });
            Ok(())
        }
    }
}

fn print_ack(format: &str, cmd: &str, ack: &plugins::dialectic::SubmissionAck) {
    let value = serde_json::to_value(ack).unwrap_or_default();
    emit(format, cmd, value, || {
        if ack.duplicate {
            println!(
                "Duplicate submission acknowledged; session {} stays at {}",
                ack.session.id, ack.session.phase
            );
        } else {
            println!("Session {} now at {}", ack.session.id, ack.session.phase);
        }
    });
}

fn print_report(report: &govern::GovernanceReport) {
    let tier = report.verdict.tier();
    let colored_tier = match tier {
        "proceed" => tier.bright_green(),
        "proceed-with-caution" => tier.bright_yellow(),
        _ => tier.bright_red(),
    };
    println!(
        "{} {} (confidence {:.2}, attention {:.2}, regime {})",
        report.agent_id.bright_white(),
        colored_tier,
        report.confidence,
        report.attention,
        report.regime
    );
    println!("  reason: {}", report.reason);
    println!(
        "  E {:.3}  I {:.3}  S {:.3}  V {:+.3}  C {:.3}  sens {:.2}  update #{}",
        report.state.energy,
        report.state.integrity,
        report.state.entropy,
        report.state.void_,
        report.state.coherence,
        report.sensitivity,
        report.update_count
    );
    for w in &report.warnings {
        println!("  {} {}", "⚠".bright_yellow(), w);
    }
}
