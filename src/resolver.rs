use std::collections::BTreeMap;
use tracing::debug;

/// Pairs below this similarity are never considered a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.3;

/// String similarity in [0, 1]. The pairing logic is independent of the
/// metric; swap in trigram or edit-distance scoring without touching it.
pub trait Similarity {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Jaro-Winkler on lowercased input. Rewards shared prefixes, which suits
/// country names that differ in accents or transliteration.
#[derive(Debug, Default, Clone, Copy)]
pub struct JaroWinkler;

impl Similarity for JaroWinkler {
    fn score(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        strsim::jaro_winkler(&a.to_lowercase(), &b.to_lowercase())
    }
}

/// A canonical country record from the reference catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCountry {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountryMatch {
    pub source_name: String,
    pub score: f64,
}

/// One output row per canonical entry. The canonical side is never dropped;
/// it may merely fail to be enriched.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCountry {
    pub code: String,
    pub name: String,
    pub matched: Option<CountryMatch>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionStats {
    pub matched: usize,
    pub unmatched_canonical: usize,
    pub unmatched_candidates: usize,
}

/// Pair free-text country names against the canonical catalog.
///
/// Every (candidate, canonical) pair at or above the threshold is scored;
/// a pairing is accepted only when each side is the other's top choice
/// (mutual best match). This prevents a generic name fragment from claiming
/// several canonical entries. Ranking ties break on higher score then
/// lexicographic order, so the result is deterministic.
pub fn match_countries(
    candidates: &[String],
    canonical: &[CanonicalCountry],
    metric: &dyn Similarity,
    threshold: f64,
) -> (Vec<ResolvedCountry>, ResolutionStats) {
    // Deduplicate candidates; sorted for deterministic iteration
    let mut unique_candidates: Vec<&String> = candidates.iter().collect();
    unique_candidates.sort();
    unique_candidates.dedup();

    // best canonical code per candidate
    let mut best_canonical: BTreeMap<&str, (&CanonicalCountry, f64)> = BTreeMap::new();
    // best candidate per canonical code
    let mut best_candidate: BTreeMap<&str, (&str, f64)> = BTreeMap::new();

    for candidate in &unique_candidates {
        for country in canonical {
            let score = metric.score(candidate, &country.name);
            if score < threshold {
                continue;
            }

            match best_canonical.get(candidate.as_str()) {
                Some((held, held_score))
                    if better(*held_score, &held.name, score, &country.name) => {}
                _ => {
                    best_canonical.insert(candidate.as_str(), (country, score));
                }
            }

            match best_candidate.get(country.code.as_str()) {
                Some((held, held_score)) if better(*held_score, held, score, candidate) => {}
                _ => {
                    best_candidate.insert(country.code.as_str(), (candidate.as_str(), score));
                }
            }
        }
    }

    let mut stats = ResolutionStats::default();
    let mut resolved = Vec::with_capacity(canonical.len());

    for country in canonical {
        let matched = best_candidate.get(country.code.as_str()).and_then(|(candidate, score)| {
            // mutual: the candidate's own best must be this canonical entry
            match best_canonical.get(*candidate) {
                Some((back, _)) if back.code == country.code => Some(CountryMatch {
                    source_name: candidate.to_string(),
                    score: *score,
                }),
                _ => {
                    debug!(
                        "Ambiguous country match dropped: '{}' vs '{}'",
                        candidate, country.name
                    );
                    None
                }
            }
        });

        if matched.is_some() {
            stats.matched += 1;
        } else {
            stats.unmatched_canonical += 1;
        }

        resolved.push(ResolvedCountry {
            code: country.code.clone(),
            name: country.name.clone(),
            matched,
        });
    }

    let matched_sources: Vec<&str> = resolved
        .iter()
        .filter_map(|r| r.matched.as_ref().map(|m| m.source_name.as_str()))
        .collect();
    stats.unmatched_candidates = unique_candidates
        .iter()
        .filter(|c| !matched_sources.contains(&c.as_str()))
        .count();

    (resolved, stats)
}

/// True when the held (score, name) pair still beats the challenger.
fn better(held_score: f64, held_name: &str, score: f64, name: &str) -> bool {
    match held_score.total_cmp(&score) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => held_name <= name,
    }
}

/// Lookup from raw source country name to canonical code, derived from a
/// resolution pass.
pub fn code_lookup(resolved: &[ResolvedCountry]) -> BTreeMap<String, String> {
    resolved
        .iter()
        .filter_map(|r| {
            r.matched
                .as_ref()
                .map(|m| (m.source_name.clone(), r.code.clone()))
        })
        .collect()
}
