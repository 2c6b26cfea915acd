//! Consensus strategies: pure functions from a proposal set to an outcome.
//! Adding a strategy means adding a tag and a dispatch arm.

use crate::{
    config::ConsensusConfig,
    constants::CHARS_PER_TOKEN,
    models::{ConsensusStrategy, Proposal},
};
use std::collections::BTreeMap;

/// What a strategy concluded; the engine turns this into a Decision row.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub consensus: bool,
    pub winning_proposal_id: Option<String>,
    pub runner_up_ids: Vec<String>,
    pub content: String,
    pub confidence: f64,
    pub rationale: String,
}

/// Four characters per token when the agent did not report counts.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len().div_ceil(CHARS_PER_TOKEN)) as u64
}

pub fn proposal_tokens(proposal: &Proposal) -> u64 {
    let reported = proposal.tokens_in + proposal.tokens_out;
    if reported > 0 {
        reported
    } else {
        estimate_tokens(&proposal.content)
    }
}

/// Dispatch one strategy over the active proposal set.
///
/// The engine fails a task with zero proposals before ever reaching a
/// strategy; the empty guard here keeps that invariant local.
pub fn execute(
    strategy: ConsensusStrategy,
    proposals: &[Proposal],
    config: &ConsensusConfig,
) -> StrategyOutcome {
    if proposals.is_empty() {
        return StrategyOutcome {
            consensus: false,
            winning_proposal_id: None,
            runner_up_ids: Vec::new(),
            content: String::new(),
            confidence: 0.0,
            rationale: "no proposals to evaluate".to_string(),
        };
    }
    match strategy {
        ConsensusStrategy::Solo => solo(proposals),
        ConsensusStrategy::Voting => voting(proposals, config.approval_threshold),
        ConsensusStrategy::ReasoningQuality => reasoning_quality(proposals, config.quality_margin),
        ConsensusStrategy::Merge => merge(proposals),
        ConsensusStrategy::TokenOptimization => token_optimization(proposals),
        ConsensusStrategy::RrfFusion => rrf_fusion(proposals, config.rrf_k),
    }
}

fn sorted_ids_excluding(proposals: &[Proposal], winner: &str) -> Vec<String> {
    let mut rest: Vec<&Proposal> = proposals.iter().filter(|p| p.id != winner).collect();
    rest.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    rest.into_iter().map(|p| p.id.clone()).collect()
}

fn mean_confidence(proposals: &[&Proposal]) -> f64 {
    if proposals.is_empty() {
        return 0.0;
    }
    let sum: f64 = proposals.iter().map(|p| p.confidence).sum();
    (sum / proposals.len() as f64).clamp(0.0, 1.0)
}

/// Degenerate single-proposal path used by solo and direct-assignment
/// flows.
fn solo(proposals: &[Proposal]) -> StrategyOutcome {
    let mut ranked: Vec<&Proposal> = proposals.iter().collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    let winner = ranked[0];
    StrategyOutcome {
        consensus: true,
        winning_proposal_id: Some(winner.id.clone()),
        runner_up_ids: sorted_ids_excluding(proposals, &winner.id),
        content: winner.content.clone(),
        confidence: winner.confidence.clamp(0.0, 1.0),
        rationale: format!("single-agent result from {}", winner.agent_id),
    }
}

/// Categorical voting: each proposal is a vote for its declared choice or,
/// failing that, its exact content. Consensus requires the winner's share
/// to reach the approval threshold; ties break on summed confidence, then
/// earliest submission.
fn voting(proposals: &[Proposal], approval_threshold: f64) -> StrategyOutcome {
    let mut groups: BTreeMap<&str, Vec<&Proposal>> = BTreeMap::new();
    for proposal in proposals {
        let key = proposal.choice().unwrap_or(proposal.content.as_str());
        groups.entry(key).or_default().push(proposal);
    }

    let mut ranked: Vec<(&str, Vec<&Proposal>)> = groups.into_iter().collect();
    ranked.sort_by(|(_, a), (_, b)| {
        b.len().cmp(&a.len()).then_with(|| {
            let conf_a: f64 = a.iter().map(|p| p.confidence).sum();
            let conf_b: f64 = b.iter().map(|p| p.confidence).sum();
            conf_b
                .partial_cmp(&conf_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let first_a = a.iter().map(|p| p.created_at).min();
                    let first_b = b.iter().map(|p| p.created_at).min();
                    first_a.cmp(&first_b)
                })
        })
    });

    let (_, winners) = &ranked[0];
    let share = winners.len() as f64 / proposals.len() as f64;
    let mut winner_group = winners.clone();
    winner_group.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    let winner = winner_group[0];

    StrategyOutcome {
        consensus: share >= approval_threshold,
        winning_proposal_id: Some(winner.id.clone()),
        runner_up_ids: sorted_ids_excluding(proposals, &winner.id),
        content: winner.content.clone(),
        confidence: mean_confidence(&winner_group),
        rationale: format!(
            "{} of {} votes ({share:.2} share) for the winning choice",
            winners.len(),
            proposals.len()
        ),
    }
}

/// Rubric axes scored 0..=1 from the proposal text.
fn keyword_axis(content: &str, needles: &[&str], per_hit: f64) -> f64 {
    let haystack = content.to_lowercase();
    let hits = needles
        .iter()
        .filter(|needle| haystack.contains(**needle))
        .count();
    (hits as f64 * per_hit).min(1.0)
}

pub(super) fn reasoning_score(content: &str) -> f64 {
    let rationale = keyword_axis(
        content,
        &["because", "rationale", "therefore", "trade-off", "tradeoff", "reasoning"],
        0.5,
    );
    let edge_cases = keyword_axis(
        content,
        &["edge case", "boundary", "corner case", "fails when", "empty input", "overflow", "timeout"],
        0.34,
    );
    let prior_art = keyword_axis(
        content,
        &["similar to", "prior art", "previously", "existing", "reference", "upstream", "http"],
        0.5,
    );
    0.40 * rationale + 0.35 * edge_cases + 0.25 * prior_art
}

/// Rubric scoring: rationale 0.40, edge-case enumeration 0.35, prior-art
/// citation 0.25. Consensus iff the gap to the runner-up exceeds the
/// configured margin.
fn reasoning_quality(proposals: &[Proposal], quality_margin: f64) -> StrategyOutcome {
    let mut scored: Vec<(f64, &Proposal)> = proposals
        .iter()
        .map(|p| (reasoning_score(&p.content), p))
        .collect();
    scored.sort_by(|(sa, pa), (sb, pb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                pb.confidence
                    .partial_cmp(&pa.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| pa.created_at.cmp(&pb.created_at))
    });

    let (best_score, winner) = scored[0];
    let gap = match scored.get(1) {
        Some((second, _)) => best_score - second,
        None => 1.0,
    };

    StrategyOutcome {
        consensus: gap > quality_margin,
        winning_proposal_id: Some(winner.id.clone()),
        runner_up_ids: sorted_ids_excluding(proposals, &winner.id),
        content: winner.content.clone(),
        confidence: winner.confidence.clamp(0.0, 1.0),
        rationale: format!(
            "reasoning quality {best_score:.2}, gap {gap:.2} over {} rivals",
            proposals.len() - 1
        ),
    }
}

fn section_key(section: &str) -> String {
    section
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('#')
        .trim()
        .to_lowercase()
}

/// Union of distinct structural sections across all proposals, preferring
/// higher-confidence contributors on key conflicts. Merge always produces
/// output when at least one proposal exists.
fn merge(proposals: &[Proposal]) -> StrategyOutcome {
    let mut order: Vec<String> = Vec::new();
    let mut sections: BTreeMap<String, (f64, String)> = BTreeMap::new();

    let mut by_confidence: Vec<&Proposal> = proposals.iter().collect();
    by_confidence.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    for proposal in &by_confidence {
        for section in proposal.content.split("\n\n").filter(|s| !s.trim().is_empty()) {
            let key = section_key(section);
            match sections.get(&key) {
                Some((existing_conf, _)) if *existing_conf >= proposal.confidence => {}
                Some(_) => {
                    sections.insert(key, (proposal.confidence, section.trim().to_string()));
                }
                None => {
                    order.push(key.clone());
                    sections.insert(key, (proposal.confidence, section.trim().to_string()));
                }
            }
        }
    }

    let content = order
        .iter()
        .filter_map(|key| sections.get(key).map(|(_, text)| text.as_str()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let all: Vec<&Proposal> = proposals.iter().collect();
    let winner = by_confidence[0];
    StrategyOutcome {
        consensus: true,
        winning_proposal_id: Some(winner.id.clone()),
        runner_up_ids: sorted_ids_excluding(proposals, &winner.id),
        content,
        confidence: mean_confidence(&all),
        rationale: format!(
            "merged {} sections from {} proposals",
            order.len(),
            proposals.len()
        ),
    }
}

/// Quality per token; quality defaults to confidence when no rubric is
/// available.
fn token_optimization(proposals: &[Proposal]) -> StrategyOutcome {
    let mut scored: Vec<(f64, &Proposal)> = proposals
        .iter()
        .map(|p| {
            let tokens = proposal_tokens(p).max(1);
            (p.confidence / tokens as f64, p)
        })
        .collect();
    scored.sort_by(|(sa, pa), (sb, pb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                pb.confidence
                    .partial_cmp(&pa.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| pa.created_at.cmp(&pb.created_at))
    });

    let (best, winner) = scored[0];
    StrategyOutcome {
        consensus: true,
        winning_proposal_id: Some(winner.id.clone()),
        runner_up_ids: sorted_ids_excluding(proposals, &winner.id),
        content: winner.content.clone(),
        confidence: winner.confidence.clamp(0.0, 1.0),
        rationale: format!(
            "best quality-per-token {best:.6} across {} proposals",
            proposals.len()
        ),
    }
}

/// Reciprocal rank fusion over the ranked items (lines) each proposal
/// produced: RRF(item) = sum over proposals of 1/(k + rank).
fn rrf_fusion(proposals: &[Proposal], k: f64) -> StrategyOutcome {
    const FUSED_TOP_N: usize = 10;

    let mut scores: BTreeMap<String, f64> = BTreeMap::new();
    for proposal in proposals {
        for (rank, line) in proposal
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
        {
            *scores.entry(line.to_string()).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
        }
    }

    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|(ia, sa), (ib, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ia.cmp(ib))
    });
    fused.truncate(FUSED_TOP_N);

    // The winner is the proposal whose ranking agrees most with the fusion.
    let mut agreement: Vec<(f64, &Proposal)> = proposals
        .iter()
        .map(|p| {
            let total: f64 = fused
                .iter()
                .filter(|(item, _)| p.content.lines().any(|l| l.trim() == item))
                .map(|(_, score)| score)
                .sum();
            (total, p)
        })
        .collect();
    agreement.sort_by(|(sa, pa), (sb, pb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| pa.created_at.cmp(&pb.created_at))
    });

    let winner = agreement[0].1;
    let all: Vec<&Proposal> = proposals.iter().collect();
    let content = fused
        .iter()
        .map(|(item, _)| item.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    StrategyOutcome {
        consensus: true,
        winning_proposal_id: Some(winner.id.clone()),
        runner_up_ids: sorted_ids_excluding(proposals, &winner.id),
        content,
        confidence: mean_confidence(&all),
        rationale: format!("fused top {} items across {} rankings", fused.len(), proposals.len()),
    }
}
