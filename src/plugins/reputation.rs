//! Reputation engine: decayed, multi-dimensional agent standing.
//!
//! An agent's profile holds one [`Dimension`] per named facet (reliability,
//! quality, ...) plus `domain-competence:<domain>` dimensions, and the
//! append-only log of every [`Signal`] that shaped them.
//!
//! Stored scores are never decayed in place. Reads compute the effective
//! score by relaxing the stored value toward the neutral prior 0.5:
//!
//! `effective = 0.5 + (stored - 0.5) * exp(-decay_rate * months_since_last_signal)`
//!
//! A new signal is fused into the decayed prior with a fixed weight:
//!
//! `score = fusion_weight * signal + (1 - fusion_weight) * decayed`
//!
//! and `confidence = 1 - 1 / (1 + 0.1 * sample_size)`.
//!
//! Every update is one read-fuse-write cycle under the profile's record lock,
//! so concurrent posters never lose each other's signals.

use crate::core::atomic::{self, WriteOptions};
use crate::core::config::ReputationConfig;
use crate::core::error::WorkspaceError;
use crate::core::lock::{LockOptions, LockRegistry};
use crate::core::store::{self, Workspace};
use crate::core::time;
use clap::{Parser, Subcommand};
use colored::Colorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub const NEUTRAL_SCORE: f64 = 0.5;
pub const DOMAIN_COMPETENCE: &str = "domain-competence";
const CONFIDENCE_SCALE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    /// Undecayed score as of `last_signal`.
    pub score: f64,
    pub confidence: f64,
    pub sample_size: u64,
    pub last_signal: i64,
}

impl Dimension {
    pub fn effective_score(&self, now: i64, config: &ReputationConfig) -> f64 {
        decay_score(self.score, self.last_signal, now, config)
    }
}

/// Relax `stored` toward 0.5 for the time elapsed since `last_signal`.
pub fn decay_score(stored: f64, last_signal: i64, now: i64, config: &ReputationConfig) -> f64 {
    let months = now.saturating_sub(last_signal) as f64 / config.month_ms as f64;
    if months <= 0.0 {
        return stored;
    }
    let factor = (-config.decay_rate * months).exp();
    NEUTRAL_SCORE + (stored - NEUTRAL_SCORE) * factor
}

/// Confidence after `sample_size` signals: 0 at zero, approaching 1.
pub fn confidence_for(sample_size: u64) -> f64 {
    1.0 - 1.0 / (1.0 + sample_size as f64 * CONFIDENCE_SCALE)
}

/// Fold one signal into the (possibly missing) prior dimension.
pub fn fuse(
    prior: Option<&Dimension>,
    signal_score: f64,
    now: i64,
    config: &ReputationConfig,
) -> Dimension {
    let (score, sample_size) = match prior {
        Some(prior) => {
            let decayed = prior.effective_score(now, config);
            let alpha = config.fusion_weight;
            (
                alpha * signal_score + (1.0 - alpha) * decayed,
                prior.sample_size + 1,
            )
        }
        None => (signal_score, 1),
    };
    Dimension {
        score: score.clamp(0.0, 1.0),
        confidence: confidence_for(sample_size),
        sample_size,
        last_signal: now,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub source: String,
    pub dimension: String,
    pub score: f64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub agent_id: String,
    pub display_name: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Dimension>,
    /// `domain-competence:<domain>` dimensions keyed by domain.
    #[serde(default)]
    pub domains: BTreeMap<String, Dimension>,
    #[serde(default)]
    pub signals: Vec<Signal>,
}

/// Identity required to create a profile on its first signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub agent_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct SignalInput {
    pub source: String,
    pub dimension: String,
    pub score: f64,
    pub now: i64,
    pub domain: Option<String>,
    pub evidence: Option<String>,
    pub message: Option<String>,
    pub new_profile: Option<NewProfile>,
}

impl SignalInput {
    pub fn new(source: &str, dimension: &str, score: f64, now: i64) -> Self {
        Self {
            source: source.to_string(),
            dimension: dimension.to_string(),
            score,
            now,
            domain: None,
            evidence: None,
            message: None,
            new_profile: None,
        }
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn evidence(mut self, evidence: &str) -> Self {
        self.evidence = Some(evidence.to_string());
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn new_profile(mut self, agent_id: &str, display_name: &str) -> Self {
        self.new_profile = Some(NewProfile {
            agent_id: agent_id.to_string(),
            display_name: display_name.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveDimension {
    #[serde(flatten)]
    pub stored: Dimension,
    pub effective_score: f64,
}

/// A profile as seen at some instant: every dimension carries its decayed score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoratedProfile {
    pub agent_id: String,
    pub display_name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub evaluated_at: i64,
    /// Confidence-weighted mean of the effective top-level scores.
    pub overall: f64,
    pub dimensions: BTreeMap<String, EffectiveDimension>,
    pub domains: BTreeMap<String, EffectiveDimension>,
    pub signal_count: usize,
}

enum Target {
    Dimension(String),
    Domain(String),
}

fn dimension_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("dimension regex is valid"))
}

fn resolve_target(input: &SignalInput) -> Result<Target, WorkspaceError> {
    let qualified = input
        .dimension
        .strip_prefix(DOMAIN_COMPETENCE)
        .and_then(|rest| rest.strip_prefix(':'));

    if let Some(domain) = qualified {
        if let Some(given) = &input.domain {
            if given != domain {
                return Err(WorkspaceError::ValidationError(format!(
                    "dimension '{}' conflicts with domain '{}'",
                    input.dimension, given
                )));
            }
        }
        return domain_target(domain);
    }
    if input.dimension == DOMAIN_COMPETENCE {
        return match &input.domain {
            Some(domain) => domain_target(domain),
            None => Err(WorkspaceError::ValidationError(format!(
                "'{}' signals require a domain",
                DOMAIN_COMPETENCE
            ))),
        };
    }
    if !dimension_name_re().is_match(&input.dimension) {
        return Err(WorkspaceError::ValidationError(format!(
            "invalid dimension name '{}'",
            input.dimension
        )));
    }
    Ok(Target::Dimension(input.dimension.clone()))
}

fn domain_target(domain: &str) -> Result<Target, WorkspaceError> {
    let domain = domain.trim();
    if domain.is_empty() {
        return Err(WorkspaceError::ValidationError(
            "domain must not be empty".to_string(),
        ));
    }
    Ok(Target::Domain(domain.to_string()))
}

fn validate_input(input: &SignalInput) -> Result<Target, WorkspaceError> {
    if !input.score.is_finite() || !(0.0..=1.0).contains(&input.score) {
        return Err(WorkspaceError::ValidationError(format!(
            "signal score must be within [0, 1], got {}",
            input.score
        )));
    }
    if input.source.trim().is_empty() {
        return Err(WorkspaceError::ValidationError(
            "signal source must not be empty".to_string(),
        ));
    }
    if let Some(hint) = &input.new_profile {
        store::validate_agent_id(&hint.agent_id)?;
        if hint.display_name.trim().is_empty() {
            return Err(WorkspaceError::ValidationError(
                "cannot create profile without identity".to_string(),
            ));
        }
    }
    resolve_target(input)
}

pub struct ReputationEngine {
    locks: Arc<LockRegistry>,
    config: ReputationConfig,
    lock_options: LockOptions,
    write_options: WriteOptions,
}

impl ReputationEngine {
    pub fn new(locks: Arc<LockRegistry>, config: ReputationConfig) -> Self {
        Self {
            locks,
            config,
            lock_options: LockOptions::default(),
            write_options: WriteOptions::default(),
        }
    }

    pub fn for_workspace(workspace: &Workspace, locks: Arc<LockRegistry>) -> Self {
        Self {
            locks,
            config: workspace.config.reputation.clone(),
            lock_options: workspace.config.lock_options(),
            write_options: workspace.config.write_options(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn with_write_options(mut self, options: WriteOptions) -> Self {
        self.write_options = options;
        self
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Append a signal to the profile at `profile_path` and return the fused dimension.
    pub fn post_signal(
        &self,
        profile_path: &Path,
        input: SignalInput,
    ) -> Result<Dimension, WorkspaceError> {
        let target = validate_input(&input)?;
        if let Some(hint) = &input.new_profile {
            // The file name is the agent id; a hint for another agent would
            // create a profile that `profile_path` can never find.
            if profile_path.file_stem().and_then(|s| s.to_str()) != Some(hint.agent_id.as_str()) {
                return Err(WorkspaceError::ValidationError(format!(
                    "profile {} does not belong to agent '{}'",
                    profile_path.display(),
                    hint.agent_id
                )));
            }
        }

        self.locks
            .with_lock(profile_path, self.lock_options, || {
                // A corrupt profile loads as `None`: it is recreated from the
                // identity hint, or rejected below when there is none.
                let existing: Option<Profile> = atomic::load_json(profile_path)?;
                let mut profile = match (existing, &input.new_profile) {
                    (Some(profile), _) => profile,
                    (None, Some(hint)) => Profile {
                        agent_id: hint.agent_id.clone(),
                        display_name: hint.display_name.clone(),
                        created_at: input.now,
                        updated_at: input.now,
                        dimensions: BTreeMap::new(),
                        domains: BTreeMap::new(),
                        signals: Vec::new(),
                    },
                    (None, None) => {
                        return Err(WorkspaceError::ValidationError(
                            "cannot create profile without identity".to_string(),
                        ));
                    }
                };

                let slot = match &target {
                    Target::Dimension(name) => profile.dimensions.entry(name.clone()),
                    Target::Domain(domain) => profile.domains.entry(domain.clone()),
                };
                let updated = match slot {
                    std::collections::btree_map::Entry::Occupied(mut e) => {
                        let fused = fuse(Some(e.get()), input.score, input.now, &self.config);
                        e.insert(fused);
                        fused
                    }
                    std::collections::btree_map::Entry::Vacant(e) => {
                        *e.insert(fuse(None, input.score, input.now, &self.config))
                    }
                };

                profile.signals.push(Signal {
                    id: time_ordered_id(),
                    source: input.source.clone(),
                    dimension: input.dimension.clone(),
                    score: input.score,
                    timestamp: input.now,
                    domain: match &target {
                        Target::Domain(domain) => Some(domain.clone()),
                        Target::Dimension(_) => input.domain.clone(),
                    },
                    evidence: input.evidence.clone(),
                    message: input.message.clone(),
                });
                profile.updated_at = profile.updated_at.max(input.now);

                atomic::safe_write_json(profile_path, &profile, self.write_options)?;
                info!(
                    agent = %profile.agent_id,
                    dimension = %input.dimension,
                    score = updated.score,
                    samples = updated.sample_size,
                    "signal posted"
                );
                Ok(updated)
            })
    }

    /// The profile at `profile_path` with effective scores as of `now`.
    pub fn read_profile(
        &self,
        profile_path: &Path,
        now: i64,
    ) -> Result<Option<DecoratedProfile>, WorkspaceError> {
        // Unlocked snapshot read; a corrupt profile reads as absent.
        let profile: Option<Profile> = atomic::load_json(profile_path)?;
        Ok(profile.map(|p| self.decorate(&p, now)))
    }

    /// Best-effort scan of every profile in `dir`, sorted by agent id.
    pub fn list_profiles(
        &self,
        dir: &Path,
        now: i64,
    ) -> Result<Vec<DecoratedProfile>, WorkspaceError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WorkspaceError::IoError(e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_profile(&path, now)? {
                Some(profile) => out.push(profile),
                None => debug!(path = %path.display(), "skipping unreadable profile"),
            }
        }
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(out)
    }

    pub fn decorate(&self, profile: &Profile, now: i64) -> DecoratedProfile {
        let effective = |dims: &BTreeMap<String, Dimension>| {
            dims.iter()
                .map(|(name, d)| {
                    (
                        name.clone(),
                        EffectiveDimension {
                            stored: *d,
                            effective_score: d.effective_score(now, &self.config),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>()
        };
        let dimensions = effective(&profile.dimensions);
        let domains = effective(&profile.domains);

        let (weighted, weight) = dimensions.values().fold((0.0, 0.0), |(sum, w), d| {
            (
                sum + d.effective_score * d.stored.confidence,
                w + d.stored.confidence,
            )
        });
        let overall = if weight > 0.0 {
            weighted / weight
        } else {
            NEUTRAL_SCORE
        };

        DecoratedProfile {
            agent_id: profile.agent_id.clone(),
            display_name: profile.display_name.clone(),
            created_at: profile.created_at,
            updated_at: profile.updated_at,
            evaluated_at: now,
            overall,
            dimensions,
            domains,
            signal_count: profile.signals.len(),
        }
    }
}

fn time_ordered_id() -> String {
    ulid::Ulid::new().to_string()
}

#[derive(Parser, Debug)]
#[clap(name = "reputation", about = "Post signals and read agent reputation")]
pub struct ReputationCli {
    #[clap(subcommand)]
    pub command: ReputationCommand,
}

#[derive(Subcommand, Debug)]
pub enum ReputationCommand {
    /// Post one signal for an agent dimension.
    Post {
        #[clap(long)]
        agent: String,
        #[clap(long)]
        dimension: String,
        #[clap(long)]
        score: f64,
        /// Domain for `domain-competence` signals, context for others.
        #[clap(long)]
        domain: Option<String>,
        #[clap(long, default_value = "cli")]
        source: String,
        #[clap(long)]
        evidence: Option<String>,
        #[clap(long)]
        message: Option<String>,
        /// Display name; required the first time an agent receives a signal.
        #[clap(long)]
        name: Option<String>,
    },
    /// Show an agent's decayed reputation.
    Show {
        #[clap(long)]
        agent: String,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// List all profiles in the workspace.
    List {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

pub fn run_reputation_cli(
    workspace: &Workspace,
    locks: Arc<LockRegistry>,
    cli: ReputationCli,
) -> Result<(), WorkspaceError> {
    let engine = ReputationEngine::for_workspace(workspace, locks);
    let now = time::now_epoch_ms();
    match cli.command {
        ReputationCommand::Post {
            agent,
            dimension,
            score,
            domain,
            source,
            evidence,
            message,
            name,
        } => {
            let path = workspace.profile_path(&agent)?;
            let mut input = SignalInput::new(&source, &dimension, score, now);
            input.domain = domain;
            input.evidence = evidence;
            input.message = message;
            if let Some(name) = name {
                input = input.new_profile(&agent, &name);
            }
            let updated = engine.post_signal(&path, input)?;
            println!(
                "{} {} score={:.3} confidence={:.3} samples={}",
                agent, dimension, updated.score, updated.confidence, updated.sample_size
            );
        }
        ReputationCommand::Show { agent, format } => {
            let path = workspace.profile_path(&agent)?;
            let Some(profile) = engine.read_profile(&path, now)? else {
                return Err(WorkspaceError::NotFound(format!(
                    "no reputation profile for '{}'",
                    agent
                )));
            };
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                print!("{}", render_profile(&profile));
            }
        }
        ReputationCommand::List { format } => {
            let profiles = engine.list_profiles(&workspace.reputation_dir(), now)?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&profiles)?);
            } else if profiles.is_empty() {
                println!("No reputation profiles.");
            } else {
                for p in &profiles {
                    println!(
                        "{:<24} {:<24} overall={:.3} signals={}",
                        p.agent_id, p.display_name, p.overall, p.signal_count
                    );
                }
            }
        }
    }
    Ok(())
}

fn render_profile(profile: &DecoratedProfile) -> String {
    let mut out = format!(
        "{} ({})\n  overall: {}\n  signals: {}\n",
        profile.display_name.bold(),
        profile.agent_id,
        colour_score(profile.overall),
        profile.signal_count
    );
    let sections = [("dimensions", &profile.dimensions), ("domains", &profile.domains)];
    for (title, dims) in sections {
        if dims.is_empty() {
            continue;
        }
        out.push_str(&format!("  {}:\n", title));
        for (name, d) in dims {
            out.push_str(&format!(
                "    {:<20} {} (stored {:.3}, confidence {:.2}, n={}, last {})\n",
                name,
                colour_score(d.effective_score),
                d.stored.score,
                d.stored.confidence,
                d.stored.sample_size,
                time::epoch_ms_to_z(d.stored.last_signal)
            ));
        }
    }
    out
}

fn colour_score(score: f64) -> String {
    let text = format!("{:.3}", score);
    if score >= 0.7 {
        text.green().to_string()
    } else if score <= 0.3 {
        text.red().to_string()
    } else {
        text.yellow().to_string()
    }
}
