use crate::registry::Registry;
use crate::types::{Embedding, EmbeddingError, Label, MatchVerdict};
use thiserror::Error;

/// Similarity a candidate must strictly exceed to be accepted.
pub const DEFAULT_THRESHOLD: f32 = 0.45;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("degenerate embedding while scoring against {name:?}")]
    DegenerateEmbedding { name: String },
    #[error("dimension mismatch against {name:?}: probe {probe}, template {template}")]
    DimensionMismatch {
        name: String,
        probe: usize,
        template: usize,
    },
}

/// Strategy for comparing a probe embedding against the enrolled registry.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        registry: &Registry,
        threshold: f32,
    ) -> Result<MatchVerdict, MatchError>;
}

/// Cosine similarity matcher.
///
/// Scores every entry in name order. Equal scores keep the entry seen first,
/// i.e. the lexicographically smallest name.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        registry: &Registry,
        threshold: f32,
    ) -> Result<MatchVerdict, MatchError> {
        if registry.is_empty() {
            return Ok(MatchVerdict::unknown());
        }

        let mut best: Option<(&str, f32)> = None;
        for (name, template) in registry.iter() {
            let sim = probe.similarity(template).map_err(|e| match e {
                EmbeddingError::Degenerate => MatchError::DegenerateEmbedding {
                    name: name.to_string(),
                },
                EmbeddingError::DimensionMismatch { probe, template } => {
                    MatchError::DimensionMismatch {
                        name: name.to_string(),
                        probe,
                        template,
                    }
                }
            })?;

            match best {
                Some((_, best_sim)) if sim <= best_sim => {}
                _ => best = Some((name, sim)),
            }
        }

        // Registry is non-empty and every score is finite, so `best` is set.
        let (name, sim) = best.unwrap_or(("", f32::NEG_INFINITY));

        tracing::debug!(best = name, similarity = sim, threshold, "match scored");

        if sim > threshold {
            Ok(MatchVerdict {
                label: Label::Identity(name.to_string()),
                confidence: sim,
                is_accepted: true,
            })
        } else {
            Ok(MatchVerdict {
                label: Label::Unauthorised,
                confidence: sim,
                is_accepted: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(entries: &[(&str, Vec<f32>)]) -> Registry {
        entries
            .iter()
            .map(|(n, v)| (n.to_string(), Embedding::new(v.clone())))
            .collect()
    }

    #[test]
    fn test_empty_registry_is_unknown() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let verdict = CosineMatcher
            .compare(&probe, &Registry::new(), DEFAULT_THRESHOLD)
            .unwrap();
        assert_eq!(verdict.label, Label::Unknown);
        assert_eq!(verdict.confidence, 0.0);
        assert!(!verdict.is_accepted);
    }

    #[test]
    fn test_empty_registry_skips_degenerate_check() {
        // No similarity is computed when there is nothing to compare against.
        let probe = Embedding::new(vec![0.0, 0.0]);
        let verdict = CosineMatcher
            .compare(&probe, &Registry::new(), DEFAULT_THRESHOLD)
            .unwrap();
        assert_eq!(verdict.label, Label::Unknown);
    }

    #[test]
    fn test_exact_enrolled_embedding_accepted() {
        let v = vec![0.3, -0.2, 0.9, 0.1];
        let reg = registry(&[("alice", v.clone()), ("bob", vec![-0.3, 0.2, 0.1, 0.9])]);
        let verdict = CosineMatcher
            .compare(&Embedding::new(v), &reg, DEFAULT_THRESHOLD)
            .unwrap();
        assert!(verdict.is_accepted);
        assert_eq!(verdict.label, Label::Identity("alice".into()));
        assert!((verdict.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_match_found_anywhere_in_registry() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let reg = registry(&[
            ("decoy1", vec![0.0, 1.0, 0.0]),
            ("decoy2", vec![0.0, 0.0, 1.0]),
            ("zmatch", vec![1.0, 0.0, 0.0]),
        ]);
        let verdict = CosineMatcher.compare(&probe, &reg, 0.5).unwrap();
        assert_eq!(verdict.label, Label::Identity("zmatch".into()));
    }

    #[test]
    fn test_below_threshold_is_unauthorised() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let reg = registry(&[("other", vec![0.0, 1.0, 0.0])]);
        let verdict = CosineMatcher.compare(&probe, &reg, 0.5).unwrap();
        assert_eq!(verdict.label, Label::Unauthorised);
        assert!(!verdict.is_accepted);
        assert!(verdict.confidence.abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let template = Embedding::new(vec![0.6, 0.8]);
        let sim = probe.similarity(&template).unwrap();
        let reg = registry(&[("edge", template.values.clone())]);

        let at = CosineMatcher.compare(&probe, &reg, sim).unwrap();
        assert!(!at.is_accepted, "similarity equal to threshold must be rejected");
        assert_eq!(at.label, Label::Unauthorised);

        let above = CosineMatcher.compare(&probe, &reg, sim - 1e-4).unwrap();
        assert!(above.is_accepted);
        assert_eq!(above.label, Label::Identity("edge".into()));
    }

    #[test]
    fn test_near_match_accepted() {
        // cos ≈ 0.98 against alice's template
        let v = vec![1.0, 0.0];
        let probe = Embedding::new(vec![0.98, (1.0f32 - 0.98 * 0.98).sqrt()]);
        let reg = registry(&[("alice", v)]);
        let verdict = CosineMatcher.compare(&probe, &reg, DEFAULT_THRESHOLD).unwrap();
        assert!(verdict.is_accepted);
        assert_eq!(verdict.label, Label::Identity("alice".into()));
        assert!((verdict.confidence - 0.98).abs() < 1e-4);
    }

    #[test]
    fn test_tie_breaks_to_first_name() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let reg = registry(&[("bravo", vec![2.0, 0.0]), ("alpha", vec![1.0, 0.0])]);
        let verdict = CosineMatcher.compare(&probe, &reg, DEFAULT_THRESHOLD).unwrap();
        assert_eq!(verdict.label, Label::Identity("alpha".into()));
    }

    #[test]
    fn test_degenerate_probe_is_error() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(&[("alice", vec![1.0, 0.0])]);
        let err = CosineMatcher.compare(&probe, &reg, DEFAULT_THRESHOLD).unwrap_err();
        assert_eq!(err, MatchError::DegenerateEmbedding { name: "alice".into() });
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let reg = registry(&[("alice", vec![1.0, 0.0])]);
        let err = CosineMatcher.compare(&probe, &reg, DEFAULT_THRESHOLD).unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { probe: 3, template: 2, .. }));
    }
}
