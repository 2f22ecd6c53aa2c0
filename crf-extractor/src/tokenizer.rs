//! # Tokens
//!
//! O extrator não tokeniza: ele recebe tokens prontos de um tokenizador
//! externo, opcionalmente enriquecidos com etiquetas morfossintáticas (POS)
//! e um vetor denso por token (ex: embeddings).
//!
//! Para testes e demonstrações há um tokenizador simples ([`tokenize`]) que
//! separa palavras de pontuação e preserva os offsets originais.
//!
//! ## Offsets
//!
//! `start`/`end` são posições de **byte** no texto original, de forma que
//! `&text[token.start..token.end] == token.text`.

use serde::{Deserialize, Serialize};

/// Um token produzido pelo tokenizador. Imutável depois de criado.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    /// O texto do token (ex: "restaurante", ",").
    pub text: String,
    /// Índice de byte inicial no texto original (inclusive).
    pub start: usize,
    /// Índice de byte final no texto original (exclusivo).
    pub end: usize,
    /// Índice sequencial do token na sentença.
    pub index: usize,
    /// Etiqueta POS fina (ex: "NOUN", "PROPN").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<String>,
    /// Etiqueta POS grossa. Quando ausente, `pos2` usa os dois primeiros caracteres de `pos`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coarse_pos: Option<String>,
    /// Vetor denso anexado por um featurizer externo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dense: Option<Vec<f64>>,
}

impl Token {
    pub fn new(text: impl Into<String>, start: usize, end: usize, index: usize) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            index,
            pos: None,
            coarse_pos: None,
            dense: None,
        }
    }

    pub fn with_pos(mut self, pos: impl Into<String>, coarse_pos: Option<String>) -> Self {
        self.pos = Some(pos.into());
        self.coarse_pos = coarse_pos;
        self
    }

    pub fn with_dense(mut self, dense: Vec<f64>) -> Self {
        self.dense = Some(dense);
        self
    }
}

/// Tokeniza um texto: sequências alfanuméricas (com hífens internos) viram um
/// token; cada pontuação vira um token próprio; espaços são descartados.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current_start = 0;
    let mut current_text = String::new();

    for (byte_pos, ch) in text.char_indices() {
        if ch.is_alphanumeric() || (ch == '-' && !current_text.is_empty()) {
            if current_text.is_empty() {
                current_start = byte_pos;
            }
            current_text.push(ch);
        } else if ch.is_whitespace() {
            flush_token(&mut tokens, &mut current_text, current_start, byte_pos);
        } else {
            flush_token(&mut tokens, &mut current_text, current_start, byte_pos);
            push_token(&mut tokens, ch.to_string(), byte_pos, byte_pos + ch.len_utf8());
        }
    }
    flush_token(&mut tokens, &mut current_text, current_start, text.len());

    tokens
}

fn flush_token(tokens: &mut Vec<Token>, text: &mut String, start: usize, end: usize) {
    if !text.is_empty() {
        push_token(tokens, std::mem::take(text), start, end);
    }
}

fn push_token(tokens: &mut Vec<Token>, text: String, start: usize, end: usize) {
    let index = tokens.len();
    tokens.push(Token::new(text, start, end, index));
}
