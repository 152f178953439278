//! Title-similarity clustering, used as a tie-break signal.
//!
//! Candidates whose titles are near-duplicates (re-posted notices, serial
//! announcements) form clusters by Jaccard similarity over title tokens.
//! When fused scores tie, the candidate backed by the larger cluster wins.

use std::collections::HashSet;

use crate::models::Candidate;

fn title_tokens(title: &str) -> HashSet<String> {
    title
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy single-pass clustering: each title joins the first cluster whose
/// representative is at least `threshold` similar, else starts its own.
/// Returns the cluster index per input title.
pub fn cluster_titles(titles: &[&str], threshold: f64) -> Vec<usize> {
    let mut representatives: Vec<HashSet<String>> = Vec::new();
    let mut assignment = Vec::with_capacity(titles.len());

    for title in titles {
        let tokens = title_tokens(title);
        let found = representatives
            .iter()
            .position(|rep| jaccard(rep, &tokens) >= threshold);
        match found {
            Some(idx) => assignment.push(idx),
            None => {
                representatives.push(tokens);
                assignment.push(representatives.len() - 1);
            }
        }
    }

    assignment
}

/// Stable re-order of a score-sorted candidate list: inside runs of equal
/// scores, candidates from larger clusters come first.
pub fn apply_tiebreaks(candidates: &mut [Candidate], threshold: f64) {
    if candidates.len() < 2 {
        return;
    }

    let titles: Vec<&str> = candidates.iter().map(|c| c.title.as_str()).collect();
    let assignment = cluster_titles(&titles, threshold);
    let mut sizes = vec![0usize; assignment.iter().max().map(|m| m + 1).unwrap_or(0)];
    for &cluster in &assignment {
        sizes[cluster] += 1;
    }

    let cluster_size: Vec<usize> = assignment.iter().map(|&c| sizes[c]).collect();
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[b]
            .score
            .partial_cmp(&candidates[a].score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(cluster_size[b].cmp(&cluster_size[a]))
            .then(a.cmp(&b))
    });

    let reordered: Vec<Candidate> = order.iter().map(|&i| candidates[i].clone()).collect();
    candidates.clone_from_slice(&reordered);
}
