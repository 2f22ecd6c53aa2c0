//! # CRF — Conditional Random Field Linear-Chain
//!
//! Um modelo por canal (entidade, papel, grupo). O CRF aprende a
//! probabilidade condicional `P(y|x)` da sequência de rótulos `y` dada a
//! sequência de features `x`.
//!
//! ## Estrutura do Modelo
//!
//! ```text
//! score(y, x) = Σ_i [state(y_i, x_i) + transition(y_{i-1}, y_i)]
//! state(t, x_i) = Σ_a w[a, t] * valor_a(x_i)
//! P(y|x) = exp(score(y, x)) / Z(x)
//! ```
//!
//! ## Treinamento
//!
//! Descida de gradiente estocástica sobre a log-verossimilhança, uma sentença
//! por vez, na ordem do corpus (sem embaralhar), com `max_iterations` épocas:
//!
//! - **L2**: decaimento multiplicativo de todos os pesos a cada passo,
//!   implementado com um fator de escala global (custo O(1)).
//! - **L1**: penalidade cumulativa (Tsuruoka et al., 2009). Cada peso tocado
//!   num passo recebe a parte da penalidade acumulada que ainda não recebeu,
//!   sem cruzar o zero.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::FeatureMap;
use crate::inference::forward_backward;

/// Probabilidade de cada rótulo em um token.
pub type LabelProbabilities = BTreeMap<String, f64>;

/// Passo inicial da descida de gradiente.
const INITIAL_LEARNING_RATE: f64 = 0.5;
/// Em quantas épocas o passo cai pela metade.
const LEARNING_RATE_HALF_LIFE: f64 = 10.0;
/// Abaixo deste fator os pesos são reescalados para evitar underflow.
const MIN_SCALE: f64 = 1e-9;

/// Hiperparâmetros de treinamento.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrfParams {
    pub l1: f64,
    pub l2: f64,
    pub max_iterations: usize,
}

impl Default for CrfParams {
    fn default() -> Self {
        Self {
            l1: 0.1,
            l2: 0.1,
            max_iterations: 50,
        }
    }
}

/// Modelo de sequência treinável de um canal.
///
/// O extrator só depende deste contrato: treinar a partir de features e
/// rótulos por token e devolver as marginais por token.
pub trait ChannelModel: Serialize + DeserializeOwned + Send + Sync + Sized {
    fn train(features: &[Vec<FeatureMap>], tags: &[Vec<String>], params: &CrfParams) -> Result<Self>;

    /// Uma distribuição sobre [`ChannelModel::labels`] por token.
    fn predict_marginals(&self, features: &[FeatureMap]) -> Vec<LabelProbabilities>;

    fn labels(&self) -> &[String];
}

/// Pesos de um CRF treinado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfModel {
    /// Rótulos ordenados.
    labels: Vec<String>,
    /// Atributo → índice, na ordem em que apareceu no treino.
    attributes: HashMap<String, usize>,
    /// `state_weights[attr * n_labels + label]`
    state_weights: Vec<f64>,
    /// `transition_weights[prev][next]`
    transition_weights: Vec<Vec<f64>>,
}

impl CrfModel {
    /// Modelo com pesos zerados.
    pub fn new(labels: Vec<String>, attributes: Vec<String>) -> Self {
        let n = labels.len();
        let attributes: HashMap<String, usize> = attributes
            .into_iter()
            .enumerate()
            .map(|(i, a)| (a, i))
            .collect();
        Self {
            state_weights: vec![0.0; attributes.len() * n],
            transition_weights: vec![vec![0.0; n]; n],
            labels,
            attributes,
        }
    }

    pub fn n_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn n_attributes(&self) -> usize {
        self.attributes.len()
    }

    fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn state_weight(&self, attribute: &str, label: &str) -> f64 {
        match (self.attributes.get(attribute), self.label_index(label)) {
            (Some(&a), Some(t)) => self.state_weights[a * self.n_labels() + t],
            _ => 0.0,
        }
    }

    pub fn set_state_weight(&mut self, attribute: &str, label: &str, weight: f64) {
        if let (Some(&a), Some(t)) = (self.attributes.get(attribute), self.label_index(label)) {
            let n = self.n_labels();
            self.state_weights[a * n + t] = weight;
        }
    }

    pub fn transition_score(&self, prev: &str, next: &str) -> f64 {
        match (self.label_index(prev), self.label_index(next)) {
            (Some(p), Some(t)) => self.transition_weights[p][t],
            _ => 0.0,
        }
    }

    pub fn set_transition(&mut self, prev: &str, next: &str, weight: f64) {
        if let (Some(p), Some(t)) = (self.label_index(prev), self.label_index(next)) {
            self.transition_weights[p][t] = weight;
        }
    }

    /// Quantos pesos de estado são diferentes de zero.
    pub fn active_state_weights(&self) -> usize {
        self.state_weights.iter().filter(|w| **w != 0.0).count()
    }

    /// Converte as features de um token em atributos indexados, ignorando os
    /// desconhecidos e os de valor zero.
    fn index_attributes(&self, features: &FeatureMap) -> Vec<(usize, f64)> {
        features
            .attributes()
            .into_iter()
            .filter(|(_, v)| *v != 0.0)
            .filter_map(|(name, v)| self.attributes.get(&name).map(|&a| (a, v)))
            .collect()
    }

    /// `emissions[i][t] = Σ_a w[a, t] * valor_a`
    fn emission_scores(&self, sequence: &[Vec<(usize, f64)>]) -> Vec<Vec<f64>> {
        let n = self.n_labels();
        sequence
            .iter()
            .map(|attrs| {
                let mut scores = vec![0.0; n];
                for &(a, v) in attrs {
                    let row = &self.state_weights[a * n..(a + 1) * n];
                    for (score, w) in scores.iter_mut().zip(row) {
                        *score += w * v;
                    }
                }
                scores
            })
            .collect()
    }
}

impl ChannelModel for CrfModel {
    fn train(features: &[Vec<FeatureMap>], tags: &[Vec<String>], params: &CrfParams) -> Result<Self> {
        if features.len() != tags.len() {
            return Err(Error::training(format!(
                "{} sequências de features para {} sequências de rótulos",
                features.len(),
                tags.len()
            )));
        }
        if let Some(i) = (0..features.len()).find(|&i| features[i].len() != tags[i].len()) {
            return Err(Error::training(format!(
                "sentença {i}: {} tokens com features e {} rótulos",
                features[i].len(),
                tags[i].len()
            )));
        }

        let labels: Vec<String> = tags
            .iter()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if labels.is_empty() {
            return Err(Error::training("nenhum rótulo nos dados de treino"));
        }
        let label_index: HashMap<&str, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();

        // Indexa atributos na ordem em que aparecem.
        let mut attribute_index: HashMap<String, usize> = HashMap::new();
        let mut attribute_names: Vec<String> = Vec::new();
        let mut instances = Vec::with_capacity(features.len());
        for (sequence, sequence_tags) in features.iter().zip(tags) {
            if sequence.is_empty() {
                continue;
            }
            let attrs: Vec<Vec<(usize, f64)>> = sequence
                .iter()
                .map(|token_features| {
                    token_features
                        .attributes()
                        .into_iter()
                        .filter(|(_, v)| *v != 0.0)
                        .map(|(name, v)| {
                            let next = attribute_names.len();
                            let a = *attribute_index.entry(name.clone()).or_insert_with(|| {
                                attribute_names.push(name);
                                next
                            });
                            (a, v)
                        })
                        .collect()
                })
                .collect();
            let gold: Vec<usize> = sequence_tags
                .iter()
                .map(|t| label_index[t.as_str()])
                .collect();
            instances.push(Instance { attrs, gold });
        }

        let mut trainer = SgdTrainer::new(
            CrfModel::new(labels, attribute_names),
            params,
            instances.len(),
        );
        for epoch in 0..params.max_iterations {
            let eta = INITIAL_LEARNING_RATE / (1.0 + epoch as f64 / LEARNING_RATE_HALF_LIFE);
            let log_likelihood: f64 = instances.iter().map(|inst| trainer.step(inst, eta)).sum();
            debug!(epoch, log_likelihood, eta, "época concluída");
        }

        let model = trainer.finish();
        debug!(
            labels = model.n_labels(),
            attributes = model.n_attributes(),
            active = model.active_state_weights(),
            "CRF treinado"
        );
        Ok(model)
    }

    fn predict_marginals(&self, features: &[FeatureMap]) -> Vec<LabelProbabilities> {
        if features.is_empty() || self.labels.is_empty() {
            return vec![LabelProbabilities::new(); features.len()];
        }

        let sequence: Vec<Vec<(usize, f64)>> =
            features.iter().map(|f| self.index_attributes(f)).collect();
        let emissions = self.emission_scores(&sequence);
        let marginals = forward_backward(&emissions, &self.transition_weights);

        marginals
            .nodes
            .into_iter()
            .map(|probs| self.labels.iter().cloned().zip(probs).collect())
            .collect()
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Uma sentença de treino já indexada.
struct Instance {
    attrs: Vec<Vec<(usize, f64)>>,
    gold: Vec<usize>,
}

/// Estado da descida de gradiente.
///
/// Os pesos reais são `scale * weights[k]`. Estados ocupam
/// `[0, n_state)` e transições `[n_state, n_state + n_labels²)`.
struct SgdTrainer {
    model: CrfModel,
    weights: Vec<f64>,
    scale: f64,
    /// Penalidade L1 acumulada por peso até agora (`u`).
    l1_total: f64,
    /// Penalidade L1 efetivamente aplicada a cada peso (`q`).
    l1_applied: Vec<f64>,
    n_state: usize,
    l1: f64,
    l2: f64,
    n_instances: f64,
}

impl SgdTrainer {
    fn new(model: CrfModel, params: &CrfParams, n_instances: usize) -> Self {
        let n = model.n_labels();
        let n_state = model.state_weights.len();
        let total = n_state + n * n;
        Self {
            model,
            weights: vec![0.0; total],
            scale: 1.0,
            l1_total: 0.0,
            l1_applied: vec![0.0; total],
            n_state,
            l1: params.l1,
            l2: params.l2,
            n_instances: n_instances.max(1) as f64,
        }
    }

    fn weight(&self, k: usize) -> f64 {
        self.scale * self.weights[k]
    }

    fn emissions(&self, attrs: &[Vec<(usize, f64)>]) -> Vec<Vec<f64>> {
        let n = self.model.n_labels();
        attrs
            .iter()
            .map(|token_attrs| {
                (0..n)
                    .map(|t| {
                        token_attrs
                            .iter()
                            .map(|&(a, v)| self.weight(a * n + t) * v)
                            .sum()
                    })
                    .collect()
            })
            .collect()
    }

    fn transitions(&self) -> Vec<Vec<f64>> {
        let n = self.model.n_labels();
        (0..n)
            .map(|p| (0..n).map(|t| self.weight(self.n_state + p * n + t)).collect())
            .collect()
    }

    /// Um passo de SGD sobre uma sentença. Devolve a log-verossimilhança dela
    /// antes da atualização.
    fn step(&mut self, inst: &Instance, eta: f64) -> f64 {
        let n = self.model.n_labels();
        let emissions = self.emissions(&inst.attrs);
        let transitions = self.transitions();
        let marginals = forward_backward(&emissions, &transitions);

        let mut gold_score = emissions[0][inst.gold[0]];
        for i in 1..inst.gold.len() {
            gold_score += transitions[inst.gold[i - 1]][inst.gold[i]] + emissions[i][inst.gold[i]];
        }
        let log_likelihood = gold_score - marginals.log_z;

        // L2: w ← (1 - 2·η·c2/N) · w; fator não positivo zera os pesos.
        if self.l2 > 0.0 {
            let decay = 1.0 - 2.0 * eta * self.l2 / self.n_instances;
            if decay <= 0.0 {
                self.weights.fill(0.0);
                self.scale = 1.0;
            } else {
                self.scale *= decay;
                if self.scale < MIN_SCALE {
                    self.rescale();
                }
            }
        }

        let gain = eta / self.scale;
        let mut touched = Vec::new();

        // Gradiente dos estados: observado - esperado.
        for (i, attrs) in inst.attrs.iter().enumerate() {
            for &(a, v) in attrs {
                for t in 0..n {
                    let observed = if t == inst.gold[i] { 1.0 } else { 0.0 };
                    let k = a * n + t;
                    self.weights[k] += gain * v * (observed - marginals.nodes[i][t]);
                    touched.push(k);
                }
            }
        }

        // Gradiente das transições.
        let mut observed = vec![vec![0.0; n]; n];
        for pair in inst.gold.windows(2) {
            observed[pair[0]][pair[1]] += 1.0;
        }
        for p in 0..n {
            for t in 0..n {
                let k = self.n_state + p * n + t;
                self.weights[k] += gain * (observed[p][t] - marginals.transitions[p][t]);
                touched.push(k);
            }
        }

        if self.l1 > 0.0 {
            self.l1_total += eta * self.l1 / self.n_instances;
            for k in touched {
                self.apply_l1(k);
            }
        }

        log_likelihood
    }

    /// Aplica ao peso `k` a penalidade L1 pendente, sem trocar o sinal.
    fn apply_l1(&mut self, k: usize) {
        let w = self.weight(k);
        let clipped = if w > 0.0 {
            (w - (self.l1_total + self.l1_applied[k])).max(0.0)
        } else if w < 0.0 {
            (w + (self.l1_total - self.l1_applied[k])).min(0.0)
        } else {
            return;
        };
        self.l1_applied[k] += clipped - w;
        self.weights[k] = clipped / self.scale;
    }

    fn rescale(&mut self) {
        for w in &mut self.weights {
            *w *= self.scale;
        }
        self.scale = 1.0;
    }

    fn finish(mut self) -> CrfModel {
        if self.l1 > 0.0 {
            for k in 0..self.weights.len() {
                self.apply_l1(k);
            }
        }
        let n_state = self.n_state;
        for k in 0..n_state {
            self.model.state_weights[k] = self.weight(k);
        }
        self.model.transition_weights = self.transitions();
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureValue;

    fn token(word: &str) -> FeatureMap {
        let mut f = FeatureMap::new(0);
        f.insert("0:low", FeatureValue::Text(word.to_string()));
        f.insert("0:bias", FeatureValue::Number(1.0));
        f
    }

    fn dataset() -> (Vec<Vec<FeatureMap>>, Vec<Vec<String>>) {
        let sentences = [
            (vec!["voo", "para", "recife"], vec!["O", "O", "U-cidade"]),
            (vec!["voo", "para", "manaus"], vec!["O", "O", "U-cidade"]),
            (vec!["recife", "hoje"], vec!["U-cidade", "O"]),
            (vec!["manaus", "amanhã"], vec!["U-cidade", "O"]),
        ];
        let features = sentences
            .iter()
            .map(|(words, _)| words.iter().map(|w| token(w)).collect())
            .collect();
        let tags = sentences
            .iter()
            .map(|(_, tags)| tags.iter().map(|t| t.to_string()).collect())
            .collect();
        (features, tags)
    }

    #[test]
    fn test_state_and_transition_weights() {
        let mut model = CrfModel::new(
            vec!["O".into(), "U-cidade".into()],
            vec!["0:low=recife".into()],
        );
        model.set_state_weight("0:low=recife", "U-cidade", 2.5);
        model.set_transition("O", "U-cidade", 1.0);

        assert!((model.state_weight("0:low=recife", "U-cidade") - 2.5).abs() < 1e-9);
        assert!((model.transition_score("O", "U-cidade") - 1.0).abs() < 1e-9);
        // Peso padrão é zero
        assert_eq!(model.transition_score("U-cidade", "O"), 0.0);
        assert_eq!(model.state_weight("0:low=desconhecido", "O"), 0.0);
    }

    #[test]
    fn test_marginals_form_distributions() {
        let (features, tags) = dataset();
        let model = CrfModel::train(&features, &tags, &CrfParams::default()).unwrap();

        let marginals = model.predict_marginals(&features[0]);
        assert_eq!(marginals.len(), 3);
        for probs in &marginals {
            let total: f64 = probs.values().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert_eq!(probs.len(), model.labels().len());
        }
    }

    #[test]
    fn test_learns_training_data() {
        let (features, tags) = dataset();
        let model = CrfModel::train(&features, &tags, &CrfParams::default()).unwrap();

        let marginals = model.predict_marginals(&features[0]);
        assert!(marginals[2]["U-cidade"] > 0.5);
        assert!(marginals[0]["O"] > 0.5);
    }

    #[test]
    fn test_labels_sorted() {
        let (features, tags) = dataset();
        let model = CrfModel::train(&features, &tags, &CrfParams::default()).unwrap();
        assert_eq!(model.labels(), &["O".to_string(), "U-cidade".to_string()]);
    }

    #[test]
    fn test_strong_l1_zeroes_weights() {
        let (features, tags) = dataset();
        let params = CrfParams {
            l1: 1000.0,
            l2: 0.0,
            max_iterations: 5,
        };
        let model = CrfModel::train(&features, &tags, &params).unwrap();
        assert_eq!(model.active_state_weights(), 0);
    }

    fn squared_norm(model: &CrfModel) -> f64 {
        model.state_weights.iter().map(|w| w * w).sum()
    }

    #[test]
    fn test_stronger_l2_never_grows_weights() {
        let (features, tags) = dataset();
        let norm_with = |l2: f64| {
            let params = CrfParams {
                l1: 0.0,
                l2,
                max_iterations: 50,
            };
            squared_norm(&CrfModel::train(&features, &tags, &params).unwrap())
        };

        let free = norm_with(0.0);
        let mild = norm_with(0.1);
        // 2·η·c2/N > 1: o fator de decaimento seria negativo
        let strong = norm_with(10.0);
        let huge = norm_with(1000.0);

        assert!(mild < free);
        assert!(strong < mild);
        assert!(huge < mild);
    }

    #[test]
    fn test_training_is_deterministic() {
        let (features, tags) = dataset();
        let params = CrfParams::default();
        let a = CrfModel::train(&features, &tags, &params).unwrap();
        let b = CrfModel::train(&features, &tags, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let (features, mut tags) = dataset();
        tags[1].pop();
        assert!(matches!(
            CrfModel::train(&features, &tags, &CrfParams::default()),
            Err(Error::Training(_))
        ));
    }

    #[test]
    fn test_unknown_attributes_are_ignored() {
        let (features, tags) = dataset();
        let model = CrfModel::train(&features, &tags, &CrfParams::default()).unwrap();
        let unseen = vec![token("xyz")];
        let marginals = model.predict_marginals(&unseen);
        let total: f64 = marginals[0].values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
