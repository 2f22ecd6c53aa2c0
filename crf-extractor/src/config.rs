//! Configuração do extrator e contexto de execução.
//!
//! As chaves seguem o formato JSON usado nos pipelines de NLU:
//!
//! ```json
//! {
//!   "BILOU_flag": true,
//!   "features": [["low", "title", "upper"], ["low", "bias", "suffix3"], ["low", "title", "upper"]],
//!   "max_iterations": 50,
//!   "L1_c": 0.1,
//!   "L2_c": 0.1,
//!   "featurizers": [],
//!   "patterns": [{"name": "cep", "pattern": "\\d{5}-\\d{3}"}]
//! }
//! ```
//!
//! Toda chave é opcional; as ausentes assumem o valor padrão.

use serde::{Deserialize, Serialize};

use crate::crf::CrfParams;
use crate::error::{Error, Result};
use crate::features::{default_feature_lists, FeatureExtractor};
use crate::tagger::TagScheme;

/// Padrão regex nomeado, usado pela feature `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    pub pattern: String,
}

impl PatternSpec {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Usa o esquema BILOU (senão, tipos sem prefixo).
    #[serde(rename = "BILOU_flag")]
    pub bilou_flag: bool,
    /// Funções de feature por posição da janela (número ímpar de listas).
    pub features: Vec<Vec<String>>,
    /// Número de épocas de treinamento.
    pub max_iterations: usize,
    /// Coeficiente de regularização L1.
    #[serde(rename = "L1_c")]
    pub l1_c: f64,
    /// Coeficiente de regularização L2.
    #[serde(rename = "L2_c")]
    pub l2_c: f64,
    /// Featurizers densos aceitos para `text_dense_features` (vazio = qualquer um).
    pub featurizers: Vec<String>,
    pub patterns: Vec<PatternSpec>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            bilou_flag: true,
            features: default_feature_lists(),
            max_iterations: 50,
            l1_c: 0.1,
            l2_c: 0.1,
            featurizers: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

impl ExtractorConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))
    }

    pub fn scheme(&self) -> TagScheme {
        TagScheme::from_flag(self.bilou_flag)
    }

    pub fn crf_params(&self) -> CrfParams {
        CrfParams {
            l1: self.l1_c,
            l2: self.l2_c,
            max_iterations: self.max_iterations,
        }
    }

    /// Valida a configuração contra o contexto e devolve o extrator de
    /// features já compilado.
    pub fn validate(&self, context: &ExecutionContext) -> Result<FeatureExtractor> {
        let extractor = FeatureExtractor::new(&self.features, &self.patterns)?;

        if self.max_iterations == 0 {
            return Err(Error::config("'max_iterations' precisa ser maior que zero"));
        }
        for (key, value) in [("L1_c", self.l1_c), ("L2_c", self.l2_c)] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::config(format!(
                    "'{key}' precisa ser um número não negativo (recebido {value})"
                )));
            }
        }

        if extractor.uses_dense_features() {
            context.check_dense_featurizer(&self.featurizers)?;
        }

        Ok(extractor)
    }
}

/// O que o pipeline ao redor oferece ao extrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Nomes dos featurizers densos presentes no pipeline.
    pub dense_featurizers: Vec<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dense_featurizer(mut self, name: impl Into<String>) -> Self {
        self.dense_featurizers.push(name.into());
        self
    }

    fn check_dense_featurizer(&self, accepted: &[String]) -> Result<()> {
        if self.dense_featurizers.is_empty() {
            return Err(Error::config(
                "'text_dense_features' configurado, mas o pipeline não tem featurizer denso",
            ));
        }
        if !accepted.is_empty()
            && !self
                .dense_featurizers
                .iter()
                .any(|name| accepted.contains(name))
        {
            return Err(Error::config(format!(
                "nenhum featurizer denso compatível no pipeline (aceitos: {})",
                accepted.join(", ")
            )));
        }
        Ok(())
    }
}
