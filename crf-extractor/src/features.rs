//! # Engenharia de Features por Janela
//!
//! Para cada token, aplica as funções de feature configuradas a cada posição
//! de uma janela centrada nele. O resultado é um mapa esparso `chave → valor`
//! que o CRF converte em atributos.
//!
//! ## Janela
//!
//! A configuração é uma lista de listas de tamanho ímpar. Com três listas, a
//! janela cobre os offsets `-1`, `0` e `1`; a lista do meio vale para o
//! próprio token. As chaves têm a forma `"{offset}:{função}"`, por exemplo
//! `"-1:low"` ou `"0:suffix3"`.
//!
//! Quando a posição cai antes do início da sentença a feature de fronteira
//! `BOS` é marcada; depois do fim, `EOS`.
//!
//! ## Funções disponíveis
//! - `low`, `title`, `upper`, `digit`
//! - `prefix5`, `prefix2`, `suffix5`, `suffix3`, `suffix2`, `suffix1`
//! - `pos`, `pos2` (ausentes quando o token não tem POS)
//! - `bias`
//! - `pattern` (mapa nome → 1.0/0.0 dos padrões regex que cobrem o token)
//! - `text_dense_features` (mapa índice → valor do vetor denso do token)

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PatternSpec;
use crate::corpus::Sentence;
use crate::error::{Error, Result};
use crate::tokenizer::Token;

/// Valor de uma feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Number(f64),
    Text(String),
    Map(BTreeMap<String, f64>),
}

/// Features de um token.
///
/// `BTreeMap` mantém as chaves ordenadas: a mesma sentença produz sempre o
/// mesmo mapa, na mesma ordem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureMap {
    pub features: BTreeMap<String, FeatureValue>,
    /// Índice do token na sentença.
    pub token_index: usize,
}

impl FeatureMap {
    pub fn new(token_index: usize) -> Self {
        Self {
            features: BTreeMap::new(),
            token_index,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FeatureValue) {
        self.features.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FeatureValue> {
        self.features.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.features.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Achata o mapa em atributos numéricos para o CRF:
    ///
    /// - texto: `"chave=valor"` → 1.0
    /// - flag: `"chave"` → 1.0 ou 0.0
    /// - número: `"chave"` → valor
    /// - mapa: `"chave:sub"` → valor de cada entrada
    pub fn attributes(&self) -> Vec<(String, f64)> {
        let mut attrs = Vec::with_capacity(self.features.len());
        for (key, value) in &self.features {
            match value {
                FeatureValue::Text(text) => attrs.push((format!("{key}={text}"), 1.0)),
                FeatureValue::Flag(flag) => attrs.push((key.clone(), if *flag { 1.0 } else { 0.0 })),
                FeatureValue::Number(v) => attrs.push((key.clone(), *v)),
                FeatureValue::Map(entries) => {
                    for (sub, v) in entries {
                        attrs.push((format!("{key}:{sub}"), *v));
                    }
                }
            }
        }
        attrs
    }
}

/// Uma função de feature aplicável a um token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFunction {
    Low,
    Title,
    Upper,
    Digit,
    Prefix5,
    Prefix2,
    Suffix5,
    Suffix3,
    Suffix2,
    Suffix1,
    Pos,
    Pos2,
    Pattern,
    Bias,
    TextDenseFeatures,
}

impl FeatureFunction {
    pub const ALL: [FeatureFunction; 15] = [
        FeatureFunction::Low,
        FeatureFunction::Title,
        FeatureFunction::Upper,
        FeatureFunction::Digit,
        FeatureFunction::Prefix5,
        FeatureFunction::Prefix2,
        FeatureFunction::Suffix5,
        FeatureFunction::Suffix3,
        FeatureFunction::Suffix2,
        FeatureFunction::Suffix1,
        FeatureFunction::Pos,
        FeatureFunction::Pos2,
        FeatureFunction::Pattern,
        FeatureFunction::Bias,
        FeatureFunction::TextDenseFeatures,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureFunction::Low => "low",
            FeatureFunction::Title => "title",
            FeatureFunction::Upper => "upper",
            FeatureFunction::Digit => "digit",
            FeatureFunction::Prefix5 => "prefix5",
            FeatureFunction::Prefix2 => "prefix2",
            FeatureFunction::Suffix5 => "suffix5",
            FeatureFunction::Suffix3 => "suffix3",
            FeatureFunction::Suffix2 => "suffix2",
            FeatureFunction::Suffix1 => "suffix1",
            FeatureFunction::Pos => "pos",
            FeatureFunction::Pos2 => "pos2",
            FeatureFunction::Pattern => "pattern",
            FeatureFunction::Bias => "bias",
            FeatureFunction::TextDenseFeatures => "text_dense_features",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Aplica a função ao token. `None` quando a feature não se aplica
    /// (ex: `pos` sem etiqueta, `pattern` sem padrões configurados).
    fn apply(&self, token: &Token, patterns: &BTreeMap<String, f64>) -> Result<Option<FeatureValue>> {
        let word = token.text.as_str();
        let value = match self {
            FeatureFunction::Low => FeatureValue::Text(word.to_lowercase()),
            FeatureFunction::Title => FeatureValue::Flag(is_title(word)),
            FeatureFunction::Upper => FeatureValue::Flag(is_upper(word)),
            FeatureFunction::Digit => FeatureValue::Flag(is_digit(word)),
            FeatureFunction::Prefix5 => FeatureValue::Text(prefix(word, 5)),
            FeatureFunction::Prefix2 => FeatureValue::Text(prefix(word, 2)),
            FeatureFunction::Suffix5 => FeatureValue::Text(suffix(word, 5)),
            FeatureFunction::Suffix3 => FeatureValue::Text(suffix(word, 3)),
            FeatureFunction::Suffix2 => FeatureValue::Text(suffix(word, 2)),
            FeatureFunction::Suffix1 => FeatureValue::Text(suffix(word, 1)),
            FeatureFunction::Pos => match &token.pos {
                Some(pos) => FeatureValue::Text(pos.clone()),
                None => return Ok(None),
            },
            FeatureFunction::Pos2 => match (&token.coarse_pos, &token.pos) {
                (Some(coarse), _) => FeatureValue::Text(coarse.clone()),
                (None, Some(pos)) => FeatureValue::Text(prefix(pos, 2)),
                (None, None) => return Ok(None),
            },
            FeatureFunction::Pattern => {
                if patterns.is_empty() {
                    return Ok(None);
                }
                FeatureValue::Map(patterns.clone())
            }
            FeatureFunction::Bias => FeatureValue::Number(1.0),
            FeatureFunction::TextDenseFeatures => match &token.dense {
                Some(dense) => FeatureValue::Map(
                    dense
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (i.to_string(), *v))
                        .collect(),
                ),
                None => {
                    return Err(Error::MissingDenseFeatures {
                        token_index: token.index,
                        token: token.text.clone(),
                    })
                }
            },
        };
        Ok(Some(value))
    }
}

impl fmt::Display for FeatureFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuração padrão da janela: três posições, `-1`, `0` e `1`.
pub fn default_feature_lists() -> Vec<Vec<String>> {
    let context = ["low", "title", "upper"];
    let center = [
        "low", "bias", "prefix5", "prefix2", "suffix5", "suffix3", "suffix2", "upper", "title",
        "digit", "pattern",
    ];
    vec![
        context.iter().map(|s| s.to_string()).collect(),
        center.iter().map(|s| s.to_string()).collect(),
        context.iter().map(|s| s.to_string()).collect(),
    ]
}

/// Uma posição da janela e as funções aplicadas nela.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSlot {
    pub offset: isize,
    pub functions: Vec<FeatureFunction>,
}

#[derive(Debug, Clone)]
struct TokenPattern {
    name: String,
    regex: Regex,
}

/// Extrator de features configurado (janela + padrões compilados).
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    window: Vec<WindowSlot>,
    patterns: Vec<TokenPattern>,
}

impl FeatureExtractor {
    /// Valida a configuração da janela e compila os padrões regex.
    pub fn new(feature_lists: &[Vec<String>], patterns: &[PatternSpec]) -> Result<Self> {
        if feature_lists.is_empty() || feature_lists.len() % 2 == 0 {
            return Err(Error::config(format!(
                "'features' precisa ter um número ímpar de listas (recebido {})",
                feature_lists.len()
            )));
        }

        let half = (feature_lists.len() / 2) as isize;
        let mut window = Vec::with_capacity(feature_lists.len());
        for (pos, names) in feature_lists.iter().enumerate() {
            let functions = names
                .iter()
                .map(|name| {
                    FeatureFunction::from_name(name).ok_or_else(|| {
                        Error::config(format!("função de feature desconhecida: '{name}'"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            window.push(WindowSlot {
                offset: pos as isize - half,
                functions,
            });
        }

        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|regex| TokenPattern {
                        name: p.name.clone(),
                        regex,
                    })
                    .map_err(|e| Error::config(format!("padrão '{}' inválido: {e}", p.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { window, patterns })
    }

    pub fn window(&self) -> &[WindowSlot] {
        &self.window
    }

    /// Offsets da janela (ex: `[-1, 0, 1]`).
    pub fn offsets(&self) -> Vec<isize> {
        self.window.iter().map(|slot| slot.offset).collect()
    }

    pub fn uses_dense_features(&self) -> bool {
        self.window
            .iter()
            .any(|slot| slot.functions.contains(&FeatureFunction::TextDenseFeatures))
    }

    /// Extrai as features de todos os tokens da sentença.
    ///
    /// Falha apenas quando `text_dense_features` está configurado e algum
    /// token dentro da janela não tem vetor denso.
    pub fn extract(&self, sentence: &Sentence) -> Result<Vec<FeatureMap>> {
        let hits = self.pattern_hits(sentence);
        (0..sentence.tokens.len())
            .map(|i| self.extract_for_token(&sentence.tokens, i, &hits))
            .collect()
    }

    fn extract_for_token(
        &self,
        tokens: &[Token],
        i: usize,
        hits: &[BTreeMap<String, f64>],
    ) -> Result<FeatureMap> {
        let mut features = FeatureMap::new(i);
        let n = tokens.len() as isize;

        for slot in &self.window {
            let j = i as isize + slot.offset;
            if j < 0 {
                features.insert("BOS", FeatureValue::Flag(true));
                continue;
            }
            if j >= n {
                features.insert("EOS", FeatureValue::Flag(true));
                continue;
            }
            let j = j as usize;
            for function in &slot.functions {
                if let Some(value) = function.apply(&tokens[j], &hits[j])? {
                    features.insert(format!("{}:{}", slot.offset, function.name()), value);
                }
            }
        }

        Ok(features)
    }

    /// Para cada token, quais padrões casam com algum trecho que o intersecta.
    fn pattern_hits(&self, sentence: &Sentence) -> Vec<BTreeMap<String, f64>> {
        let mut hits: Vec<BTreeMap<String, f64>> = sentence
            .tokens
            .iter()
            .map(|_| {
                self.patterns
                    .iter()
                    .map(|p| (p.name.clone(), 0.0))
                    .collect()
            })
            .collect();

        for pattern in &self.patterns {
            for m in pattern.regex.find_iter(&sentence.text) {
                for (token, token_hits) in sentence.tokens.iter().zip(hits.iter_mut()) {
                    if token.start < m.end() && m.start() < token.end {
                        token_hits.insert(pattern.name.clone(), 1.0);
                    }
                }
            }
        }

        hits
    }

    /// Acrescenta a feature `"{offset}:entity"` com a tag de entidade de cada
    /// posição da janela. Usada pelos canais de papel e grupo.
    pub fn with_entity_tags(&self, base: &[FeatureMap], entity_tags: &[String]) -> Vec<FeatureMap> {
        let n = entity_tags.len() as isize;
        base.iter()
            .enumerate()
            .map(|(i, features)| {
                let mut features = features.clone();
                for slot in &self.window {
                    let j = i as isize + slot.offset;
                    if (0..n).contains(&j) {
                        features.insert(
                            format!("{}:entity", slot.offset),
                            FeatureValue::Text(entity_tags[j as usize].clone()),
                        );
                    }
                }
                features
            })
            .collect()
    }
}

/// Título no sentido usual: cada sequência de letras começa com maiúscula e
/// segue em minúsculas, e há ao menos uma letra.
fn is_title(word: &str) -> bool {
    let mut has_cased = false;
    let mut previous_cased = false;
    for ch in word.chars() {
        if ch.is_uppercase() {
            if previous_cased {
                return false;
            }
            previous_cased = true;
            has_cased = true;
        } else if ch.is_lowercase() {
            if !previous_cased {
                return false;
            }
            previous_cased = true;
            has_cased = true;
        } else {
            previous_cased = false;
        }
    }
    has_cased
}

/// Todas as letras maiúsculas, com ao menos uma letra.
fn is_upper(word: &str) -> bool {
    word.chars().any(char::is_uppercase) && !word.chars().any(char::is_lowercase)
}

fn is_digit(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_numeric())
}

fn prefix(word: &str, n: usize) -> String {
    word.chars().take(n).collect()
}

fn suffix(word: &str, n: usize) -> String {
    let len = word.chars().count();
    word.chars().skip(len.saturating_sub(n)).collect()
}
