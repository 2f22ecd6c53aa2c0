//! Escolha da tag de cada token a partir das marginais do CRF.
//!
//! As probabilidades de `B-x`, `I-x`, `L-x`, `U-x` (e `x` sem prefixo) são
//! agrupadas pelo tipo base `x` e somadas; `O` forma o próprio grupo. Vence o
//! grupo de maior soma e, dentro dele, o rótulo de maior probabilidade. A
//! confiança devolvida é a soma do grupo.
//!
//! Assim uma entidade cuja massa está espalhada entre vários prefixos não
//! perde para um `O` que isoladamente parece mais provável.

use std::collections::BTreeMap;

use crate::crf::LabelProbabilities;
use crate::tagger::{base_type, Tag};

/// Tag mais provável de um token e sua confiança.
///
/// Distribuição vazia resolve para `("O", 0.0)`. Empates entre grupos ficam
/// com o tipo base de menor ordem lexicográfica.
pub fn resolve(probabilities: &LabelProbabilities) -> (String, f64) {
    // tipo base → (soma, melhor rótulo, probabilidade do melhor rótulo)
    let mut groups: BTreeMap<&str, (f64, &str, f64)> = BTreeMap::new();
    for (label, &p) in probabilities {
        let group = groups
            .entry(base_type(label))
            .or_insert((0.0, label.as_str(), f64::NEG_INFINITY));
        group.0 += p;
        if p > group.2 {
            group.1 = label.as_str();
            group.2 = p;
        }
    }

    let mut best: Option<(f64, &str)> = None;
    for (sum, label, _) in groups.into_values() {
        if best.map_or(true, |(best_sum, _)| sum > best_sum) {
            best = Some((sum, label));
        }
    }

    match best {
        Some((sum, label)) => (label.to_string(), sum),
        None => (Tag::OUTSIDE_LABEL.to_string(), 0.0),
    }
}

/// Resolve uma sequência de marginais: uma tag e uma confiança por token.
pub fn resolve_sequence(marginals: &[LabelProbabilities]) -> (Vec<String>, Vec<f64>) {
    marginals.iter().map(resolve).unzip()
}
