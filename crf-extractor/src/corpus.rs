//! # Sentenças, Anotações e Corpus de Demonstração
//!
//! Tipos de entrada do extrator e o alinhamento das anotações com os tokens
//! da sentença.
//!
//! ## Offsets
//! As anotações (e as entidades extraídas) usam offsets de **caractere** no
//! texto. Os tokens guardam offsets de byte; [`Sentence::byte_offset`] e
//! [`Sentence::char_offset`] convertem entre os dois.
//!
//! ## Domínios do corpus de demonstração
//! - Busca de restaurantes (culinária, local)
//! - Passagens aéreas (cidade com papel origem/destino)
//! - Pedidos de pizza (tamanho e sabor agrupados por item)

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tagger::EntitySpan;
use crate::tokenizer::{tokenize, Token};

/// Uma sentença já tokenizada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    pub tokens: Vec<Token>,
}

impl Sentence {
    pub fn new(text: impl Into<String>, tokens: Vec<Token>) -> Self {
        Self {
            text: text.into(),
            tokens,
        }
    }

    /// Tokeniza o texto com o tokenizador simples do crate.
    pub fn from_text(text: &str) -> Self {
        Self::new(text, tokenize(text))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Offset de byte do caractere `char_offset`. Além do fim do texto,
    /// devolve o tamanho do texto em bytes.
    pub fn byte_offset(&self, char_offset: usize) -> usize {
        self.text
            .char_indices()
            .nth(char_offset)
            .map_or(self.text.len(), |(i, _)| i)
    }

    /// Número de caracteres antes do byte `byte_offset`.
    pub fn char_offset(&self, byte_offset: usize) -> usize {
        self.text
            .char_indices()
            .take_while(|&(i, _)| i < byte_offset)
            .count()
    }

    /// Texto original coberto pelos tokens `start_token..=end_token`.
    pub fn span_text(&self, start_token: usize, end_token: usize) -> &str {
        match (self.tokens.get(start_token), self.tokens.get(end_token)) {
            (Some(first), Some(last)) => self.text.get(first.start..last.end).unwrap_or(""),
            _ => "",
        }
    }
}

/// Entidade anotada por offsets de caractere no texto (`end` exclusivo).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAnnotation {
    pub start: usize,
    pub end: usize,
    pub value: String,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl EntityAnnotation {
    pub fn new(start: usize, end: usize, value: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            start,
            end,
            value: value.into(),
            entity: entity.into(),
            role: None,
            group: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Sentença com suas entidades anotadas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub sentence: Sentence,
    #[serde(default)]
    pub entities: Vec<EntityAnnotation>,
}

impl TrainingExample {
    pub fn new(sentence: Sentence, entities: Vec<EntityAnnotation>) -> Self {
        Self { sentence, entities }
    }

    /// Alinha as anotações aos tokens.
    ///
    /// Uma anotação cobre todo token que intersecta `[start, end)`. Se os
    /// limites não coincidem com fronteiras de token a anotação é usada assim
    /// mesmo (com aviso); se não cobre nenhum token ou sobrepõe uma anotação
    /// anterior, é descartada.
    pub fn entity_spans(&self) -> Vec<EntitySpan> {
        let tokens = &self.sentence.tokens;
        let mut taken = vec![false; tokens.len()];
        let mut spans = Vec::new();

        let mut annotations: Vec<&EntityAnnotation> = self.entities.iter().collect();
        annotations.sort_by_key(|a| (a.start, a.end));

        for ann in annotations {
            let start = self.sentence.byte_offset(ann.start);
            let end = self.sentence.byte_offset(ann.end);
            let covered: Vec<usize> = tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| t.start < end && start < t.end)
                .map(|(i, _)| i)
                .collect();

            let (Some(&first), Some(&last)) = (covered.first(), covered.last()) else {
                warn!(
                    entity = %ann.entity,
                    value = %ann.value,
                    "anotação não cobre nenhum token; ignorada"
                );
                continue;
            };

            if covered.iter().any(|&i| taken[i]) {
                warn!(
                    entity = %ann.entity,
                    value = %ann.value,
                    "anotação sobreposta a outra; ignorada"
                );
                continue;
            }

            if tokens[first].start != start || tokens[last].end != end {
                warn!(
                    entity = %ann.entity,
                    value = %ann.value,
                    "anotação desalinhada com os tokens; usando os tokens que a cobrem"
                );
            }

            for &i in &covered {
                taken[i] = true;
            }

            let mut span = EntitySpan::new(first, last, ann.entity.clone());
            span.role = ann.role.clone();
            span.group = ann.group.clone();
            spans.push(span);
        }

        spans
    }
}

/// (valor, entidade, papel, grupo)
type DemoEntity = (&'static str, &'static str, Option<&'static str>, Option<&'static str>);

/// Monta um exemplo localizando cada valor no texto, da esquerda para a direita.
fn annotate(text: &str, entities: &[DemoEntity]) -> TrainingExample {
    let mut cursor = 0;
    let mut annotations = Vec::new();

    for &(value, entity, role, group) in entities {
        let Some(offset) = text[cursor..].find(value) else {
            continue;
        };
        let start = cursor + offset;
        cursor = start + value.len();

        let char_start = text[..start].chars().count();
        let char_end = char_start + value.chars().count();
        let mut ann = EntityAnnotation::new(char_start, char_end, value, entity);
        ann.role = role.map(str::to_string);
        ann.group = group.map(str::to_string);
        annotations.push(ann);
    }

    TrainingExample::new(Sentence::from_text(text), annotations)
}

/// Corpus pequeno em PT-BR para testes e demonstração.
pub fn demo_corpus() -> Vec<TrainingExample> {
    let origem = Some("origem");
    let destino = Some("destino");

    vec![
        // ===== RESTAURANTES =====
        annotate(
            "estou procurando um restaurante italiano",
            &[("italiano", "culinaria", None, None)],
        ),
        annotate(
            "quero comida mexicana no centro",
            &[("mexicana", "culinaria", None, None), ("centro", "local", None, None)],
        ),
        annotate(
            "me mostre restaurantes chineses perto do centro",
            &[("chineses", "culinaria", None, None), ("centro", "local", None, None)],
        ),
        annotate(
            "procuro um lugar japonês na zona sul",
            &[("japonês", "culinaria", None, None), ("zona sul", "local", None, None)],
        ),
        annotate(
            "tem algum restaurante indiano aberto agora",
            &[("indiano", "culinaria", None, None)],
        ),
        annotate(
            "gostaria de comer comida italiana hoje",
            &[("italiana", "culinaria", None, None)],
        ),
        annotate(
            "onde encontro um restaurante vegano na zona norte",
            &[("vegano", "culinaria", None, None), ("zona norte", "local", None, None)],
        ),
        annotate(
            "quero um restaurante tailandês no centro",
            &[("tailandês", "culinaria", None, None), ("centro", "local", None, None)],
        ),
        annotate(
            "procurando comida árabe perto da praia",
            &[("árabe", "culinaria", None, None), ("praia", "local", None, None)],
        ),
        annotate("bom dia", &[]),
        annotate("obrigado pela ajuda", &[]),
        // ===== PASSAGENS =====
        annotate(
            "quero um voo de Recife para Salvador",
            &[("Recife", "cidade", origem, None), ("Salvador", "cidade", destino, None)],
        ),
        annotate(
            "passagem de Curitiba para Manaus amanhã",
            &[("Curitiba", "cidade", origem, None), ("Manaus", "cidade", destino, None)],
        ),
        annotate(
            "voo saindo de Fortaleza para Belém",
            &[("Fortaleza", "cidade", origem, None), ("Belém", "cidade", destino, None)],
        ),
        annotate(
            "preciso ir de Salvador para Recife",
            &[("Salvador", "cidade", origem, None), ("Recife", "cidade", destino, None)],
        ),
        annotate(
            "uma passagem de Manaus para Curitiba",
            &[("Manaus", "cidade", origem, None), ("Curitiba", "cidade", destino, None)],
        ),
        // ===== PIZZA =====
        annotate(
            "quero uma pizza grande de calabresa e uma pequena de queijo",
            &[
                ("grande", "tamanho", None, Some("1")),
                ("calabresa", "sabor", None, Some("1")),
                ("pequena", "tamanho", None, Some("2")),
                ("queijo", "sabor", None, Some("2")),
            ],
        ),
        annotate(
            "me vê uma pizza média de frango e uma grande de atum",
            &[
                ("média", "tamanho", None, Some("1")),
                ("frango", "sabor", None, Some("1")),
                ("grande", "tamanho", None, Some("2")),
                ("atum", "sabor", None, Some("2")),
            ],
        ),
        annotate(
            "uma pizza pequena de atum e uma média de calabresa",
            &[
                ("pequena", "tamanho", None, Some("1")),
                ("atum", "sabor", None, Some("1")),
                ("média", "tamanho", None, Some("2")),
                ("calabresa", "sabor", None, Some("2")),
            ],
        ),
    ]
}
