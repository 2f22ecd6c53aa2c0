//! # Esquema de Tags BILOU e Canais de Rótulo
//!
//! Define o esquema de anotação **BILOU** usado para transformar spans de
//! entidades em uma tag por token (para treinar o CRF) e o caminho inverso
//! (para reconstruir entidades a partir das tags previstas).
//!
//! ## Esquema BILOU
//!
//! - `B-X`: Begin — primeiro token de um span de vários tokens
//! - `I-X`: Inside — tokens intermediários
//! - `L-X`: Last — último token de um span de vários tokens
//! - `U-X`: Unit — span de exatamente um token
//! - `O`: Outside — fora de qualquer span
//!
//! Com `BILOU_flag = false` o esquema é plano: cada token do span recebe o
//! próprio tipo (`X`), sem prefixo.
//!
//! ## Canais
//!
//! Uma entidade composta tem tipo, papel (role) e grupo. Cada um é um canal
//! independente ([`Channel`]) com sua própria sequência de tags.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::corpus::Sentence;

/// Canal de rotulagem: tipo da entidade, papel ou grupo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Entity,
    Role,
    Group,
}

impl Channel {
    /// Ordem de inferência: papel e grupo dependem das tags de entidade.
    pub const ALL: [Channel; 3] = [Channel::Entity, Channel::Role, Channel::Group];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Entity => "entity",
            Channel::Role => "role",
            Channel::Group => "group",
        }
    }

    /// O rótulo que este canal enxerga em um span (se houver).
    pub fn label_of<'a>(&self, span: &'a EntitySpan) -> Option<&'a str> {
        match self {
            Channel::Entity => Some(span.entity.as_str()),
            Channel::Role => span.role.as_deref(),
            Channel::Group => span.group.as_deref(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Esquema de tags usado na codificação.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagScheme {
    Bilou,
    Plain,
}

impl TagScheme {
    pub fn from_flag(bilou_flag: bool) -> Self {
        if bilou_flag {
            TagScheme::Bilou
        } else {
            TagScheme::Plain
        }
    }
}

/// Tag aplicada a um token em um canal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Begin(String),
    Inside(String),
    Last(String),
    Unit(String),
    /// Tipo sem prefixo (esquema plano).
    Plain(String),
    Outside,
}

impl Tag {
    pub const OUTSIDE_LABEL: &'static str = "O";

    /// Representação textual da tag (ex: "B-cidade", "U-culinaria", "O").
    pub fn label(&self) -> String {
        match self {
            Tag::Begin(t) => format!("B-{t}"),
            Tag::Inside(t) => format!("I-{t}"),
            Tag::Last(t) => format!("L-{t}"),
            Tag::Unit(t) => format!("U-{t}"),
            Tag::Plain(t) => t.clone(),
            Tag::Outside => Self::OUTSIDE_LABEL.to_string(),
        }
    }

    /// Parseia uma tag a partir do rótulo. Nunca falha: qualquer rótulo sem
    /// prefixo BILOU válido é tratado como tipo plano.
    pub fn from_label(label: &str) -> Self {
        if label == Self::OUTSIDE_LABEL {
            return Tag::Outside;
        }
        match split_prefix(label) {
            Some(('B', t)) => Tag::Begin(t.to_string()),
            Some(('I', t)) => Tag::Inside(t.to_string()),
            Some(('L', t)) => Tag::Last(t.to_string()),
            Some(('U', t)) => Tag::Unit(t.to_string()),
            _ => Tag::Plain(label.to_string()),
        }
    }

    /// Tipo da entidade marcada (None para `O`).
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Tag::Begin(t) | Tag::Inside(t) | Tag::Last(t) | Tag::Unit(t) | Tag::Plain(t) => {
                Some(t.as_str())
            }
            Tag::Outside => None,
        }
    }

    /// Verifica se `next` pode seguir `prev` em uma sequência BILOU bem-formada.
    ///
    /// `I-X` e `L-X` só podem seguir `B-X` ou `I-X` do mesmo tipo; o mesmo vale
    /// ao contrário: depois de `B-X`/`I-X` só cabe `I-X` ou `L-X`.
    pub fn is_valid_transition(prev: Option<&Tag>, next: &Tag) -> bool {
        let open_type = match prev {
            Some(Tag::Begin(t)) | Some(Tag::Inside(t)) => Some(t.as_str()),
            _ => None,
        };
        match next {
            Tag::Inside(t) | Tag::Last(t) => open_type == Some(t.as_str()),
            _ => open_type.is_none(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn split_prefix(label: &str) -> Option<(char, &str)> {
    let mut chars = label.chars();
    let prefix = chars.next()?;
    if !matches!(prefix, 'B' | 'I' | 'L' | 'U') || chars.next()? != '-' {
        return None;
    }
    let rest = &label[2..];
    (!rest.is_empty()).then_some((prefix, rest))
}

/// Tipo base de um rótulo: `B-x`/`I-x`/`L-x`/`U-x` → `x`; qualquer outro
/// rótulo (inclusive `O`) é o próprio tipo base.
pub fn base_type(label: &str) -> &str {
    match split_prefix(label) {
        Some((_, t)) => t,
        None => label,
    }
}

/// Um span de tokens identificado em um canal.
///
/// No canal de entidade `entity` é o tipo; nos canais de papel e grupo a
/// decodificação preenche `entity` com o rótulo daquele canal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpan {
    /// Índice do primeiro token
    pub start_token: usize,
    /// Índice do último token (inclusivo)
    pub end_token: usize,
    pub entity: String,
    pub role: Option<String>,
    pub group: Option<String>,
    /// Confiança média dos tokens (0.0 a 1.0)
    pub confidence: f64,
}

impl EntitySpan {
    pub fn new(start_token: usize, end_token: usize, entity: impl Into<String>) -> Self {
        Self {
            start_token,
            end_token,
            entity: entity.into(),
            role: None,
            group: None,
            confidence: 1.0,
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

    pub fn len(&self) -> usize {
        self.end_token + 1 - self.start_token
    }

    /// `other` está inteiramente dentro deste span.
    pub fn contains(&self, other: &EntitySpan) -> bool {
        self.start_token <= other.start_token && other.end_token <= self.end_token
    }
}

/// Codifica os spans de um canal em uma tag por token.
///
/// Spans sem rótulo no canal (ex: entidade sem papel no canal `role`) deixam
/// seus tokens como `O`. Spans fora dos limites da sentença são ignorados.
pub fn encode(
    sentence: &Sentence,
    entities: &[EntitySpan],
    channel: Channel,
    scheme: TagScheme,
) -> Vec<Tag> {
    let n_tokens = sentence.tokens.len();
    let mut tags = vec![Tag::Outside; n_tokens];

    for span in entities {
        let Some(label) = channel.label_of(span) else {
            continue;
        };
        if span.start_token > span.end_token || span.end_token >= n_tokens {
            warn!(
                start = span.start_token,
                end = span.end_token,
                n_tokens,
                "span fora dos limites da sentença ignorado"
            );
            continue;
        }

        match scheme {
            TagScheme::Bilou if span.start_token == span.end_token => {
                tags[span.start_token] = Tag::Unit(label.to_string());
            }
            TagScheme::Bilou => {
                tags[span.start_token] = Tag::Begin(label.to_string());
                for tag in &mut tags[span.start_token + 1..span.end_token] {
                    *tag = Tag::Inside(label.to_string());
                }
                tags[span.end_token] = Tag::Last(label.to_string());
            }
            TagScheme::Plain => {
                for tag in &mut tags[span.start_token..=span.end_token] {
                    *tag = Tag::Plain(label.to_string());
                }
            }
        }
    }

    tags
}

/// Decodifica tags em spans, com confiança 1.0 em todos os tokens.
pub fn decode(tags: &[Tag]) -> Vec<EntitySpan> {
    decode_with_confidences(tags, &[])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Bilou,
    Plain,
}

/// Um span ainda aberto durante a varredura.
struct Run {
    start: usize,
    end: usize,
    label: String,
    kind: RunKind,
    confidence_sum: f64,
}

impl Run {
    fn open(index: usize, label: &str, kind: RunKind, confidence: f64) -> Self {
        Self {
            start: index,
            end: index,
            label: label.to_string(),
            kind,
            confidence_sum: confidence,
        }
    }

    fn continues_with(&self, label: &str, kind: RunKind) -> bool {
        self.kind == kind && self.label == label
    }

    fn extend(&mut self, index: usize, confidence: f64) {
        self.end = index;
        self.confidence_sum += confidence;
    }

    fn finish(self) -> EntitySpan {
        let count = (self.end + 1 - self.start) as f64;
        let mut span = EntitySpan::new(self.start, self.end, self.label);
        span.confidence = self.confidence_sum / count;
        span
    }
}

/// Converte uma sequência de tags (e a confiança de cada token) em spans.
///
/// Máquina de estados da esquerda para a direita:
/// - `B-X` abre um span; `I-X` continua; `L-X` fecha; `U-X` é um span completo.
/// - Tipos planos consecutivos iguais formam um único span.
/// - Um `I-X`/`L-X` sem span aberto do mesmo tipo vira um span unitário do
///   próprio tipo, fechando o que estiver aberto.
/// - Um span aberto que não chega ao `L` termina no último token aceito.
///
/// Nunca falha: todo token com tag diferente de `O` termina em exatamente um span.
/// Tokens sem confiança correspondente contam como 1.0.
pub fn decode_with_confidences(tags: &[Tag], confidences: &[f64]) -> Vec<EntitySpan> {
    let mut spans = Vec::new();
    let mut open: Option<Run> = None;

    let close = |open: &mut Option<Run>, spans: &mut Vec<EntitySpan>| {
        if let Some(run) = open.take() {
            spans.push(run.finish());
        }
    };

    for (i, tag) in tags.iter().enumerate() {
        let confidence = confidences.get(i).copied().unwrap_or(1.0);

        match tag {
            Tag::Outside => close(&mut open, &mut spans),
            Tag::Begin(t) => {
                close(&mut open, &mut spans);
                open = Some(Run::open(i, t, RunKind::Bilou, confidence));
            }
            Tag::Inside(t) => match open.take() {
                Some(mut run) if run.continues_with(t, RunKind::Bilou) => {
                    run.extend(i, confidence);
                    open = Some(run);
                }
                other => {
                    if let Some(run) = other {
                        spans.push(run.finish());
                    }
                    spans.push(Run::open(i, t, RunKind::Bilou, confidence).finish());
                }
            },
            Tag::Last(t) => match open.take() {
                Some(mut run) if run.continues_with(t, RunKind::Bilou) => {
                    run.extend(i, confidence);
                    spans.push(run.finish());
                }
                other => {
                    if let Some(run) = other {
                        spans.push(run.finish());
                    }
                    spans.push(Run::open(i, t, RunKind::Bilou, confidence).finish());
                }
            },
            Tag::Unit(t) => {
                close(&mut open, &mut spans);
                spans.push(Run::open(i, t, RunKind::Bilou, confidence).finish());
            }
            Tag::Plain(t) => match open.take() {
                Some(mut run) if run.continues_with(t, RunKind::Plain) => {
                    run.extend(i, confidence);
                    open = Some(run);
                }
                other => {
                    if let Some(run) = other {
                        spans.push(run.finish());
                    }
                    open = Some(Run::open(i, t, RunKind::Plain, confidence));
                }
            },
        }
    }
    close(&mut open, &mut spans);

    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sentence(n: usize) -> Sentence {
        let text = vec!["w"; n].join(" ");
        Sentence::from_text(&text)
    }

    fn tags(labels: &[&str]) -> Vec<Tag> {
        labels.iter().map(|l| Tag::from_label(l)).collect()
    }

    #[test]
    fn test_tag_labels_round_trip() {
        for label in ["O", "B-cidade", "I-cidade", "L-cidade", "U-culinaria", "cidade"] {
            assert_eq!(Tag::from_label(label).label(), label);
        }
        assert_eq!(Tag::from_label("U-"), Tag::Plain("U-".to_string()));
        assert_eq!(Tag::from_label("X-cidade"), Tag::Plain("X-cidade".to_string()));
    }

    #[test]
    fn test_base_type() {
        assert_eq!(base_type("B-person"), "person");
        assert_eq!(base_type("U-zona-sul"), "zona-sul");
        assert_eq!(base_type("O"), "O");
        assert_eq!(base_type("person"), "person");
    }

    #[test]
    fn test_valid_transitions() {
        let b = Tag::Begin("cidade".into());
        let i = Tag::Inside("cidade".into());
        let l = Tag::Last("cidade".into());
        assert!(Tag::is_valid_transition(Some(&b), &i));
        assert!(Tag::is_valid_transition(Some(&i), &l));
        assert!(!Tag::is_valid_transition(None, &i));
        assert!(!Tag::is_valid_transition(Some(&Tag::Outside), &l));
        assert!(!Tag::is_valid_transition(Some(&Tag::Begin("local".into())), &l));
        assert!(!Tag::is_valid_transition(Some(&b), &Tag::Outside));
    }

    #[test]
    fn test_single_token_entity_is_unit() {
        let s = sentence(1);
        let spans = vec![EntitySpan::new(0, 0, "culinaria")];
        let encoded = encode(&s, &spans, Channel::Entity, TagScheme::Bilou);
        assert_eq!(encoded, vec![Tag::Unit("culinaria".into())]);
    }

    #[test]
    fn test_encode_multi_token_span() {
        let s = sentence(5);
        let spans = vec![EntitySpan::new(1, 3, "local")];
        let encoded = encode(&s, &spans, Channel::Entity, TagScheme::Bilou);
        assert_eq!(encoded, tags(&["O", "B-local", "I-local", "L-local", "O"]));

        let plain = encode(&s, &spans, Channel::Entity, TagScheme::Plain);
        assert_eq!(plain, tags(&["O", "local", "local", "local", "O"]));
    }

    #[test]
    fn test_encode_role_and_group_channels() {
        let s = sentence(6);
        let spans = vec![
            EntitySpan::new(1, 1, "cidade").with_role("origem"),
            EntitySpan::new(3, 4, "cidade").with_group("1"),
        ];
        let roles = encode(&s, &spans, Channel::Role, TagScheme::Bilou);
        assert_eq!(roles, tags(&["O", "U-origem", "O", "O", "O", "O"]));

        let groups = encode(&s, &spans, Channel::Group, TagScheme::Bilou);
        assert_eq!(groups, tags(&["O", "O", "O", "B-1", "L-1", "O"]));
    }

    #[test]
    fn test_decode_well_formed() {
        let spans = decode(&tags(&["U-a", "O", "B-b", "I-b", "L-b", "B-a", "L-a"]));
        let ranges: Vec<(usize, usize, &str)> = spans
            .iter()
            .map(|s| (s.start_token, s.end_token, s.entity.as_str()))
            .collect();
        assert_eq!(ranges, vec![(0, 0, "a"), (2, 4, "b"), (5, 6, "a")]);
    }

    #[test]
    fn test_decode_repairs_stray_inside_and_last() {
        let spans = decode(&tags(&["I-a", "O", "L-b"]));
        assert_eq!(spans, vec![EntitySpan::new(0, 0, "a"), EntitySpan::new(2, 2, "b")]);
    }

    #[test]
    fn test_decode_repairs_type_mismatch() {
        let spans = decode(&tags(&["B-a", "I-b", "L-a"]));
        assert_eq!(
            spans,
            vec![
                EntitySpan::new(0, 0, "a"),
                EntitySpan::new(1, 1, "b"),
                EntitySpan::new(2, 2, "a"),
            ]
        );
    }

    #[test]
    fn test_decode_unterminated_run_closes_at_last_token() {
        let spans = decode(&tags(&["B-a", "I-a", "O", "B-b"]));
        assert_eq!(spans, vec![EntitySpan::new(0, 1, "a"), EntitySpan::new(3, 3, "b")]);
    }

    #[test]
    fn test_decode_plain_runs() {
        let spans = decode(&tags(&["a", "a", "b", "O", "a"]));
        assert_eq!(
            spans,
            vec![
                EntitySpan::new(0, 1, "a"),
                EntitySpan::new(2, 2, "b"),
                EntitySpan::new(4, 4, "a"),
            ]
        );
    }

    #[test]
    fn test_decode_averages_confidences() {
        let spans = decode_with_confidences(&tags(&["B-a", "L-a", "U-b"]), &[0.8, 0.6, 0.9]);
        assert!((spans[0].confidence - 0.7).abs() < 1e-12);
        assert!((spans[1].confidence - 0.9).abs() < 1e-12);
    }

    fn arbitrary_tag() -> impl Strategy<Value = Tag> {
        let label = "(a|b|cidade)";
        prop_oneof![
            Just(Tag::Outside),
            label.prop_map(Tag::Begin),
            label.prop_map(Tag::Inside),
            label.prop_map(Tag::Last),
            label.prop_map(Tag::Unit),
            label.prop_map(Tag::Plain),
        ]
    }

    proptest! {
        /// Todo token marcado cai em exatamente um span; `O` fica de fora.
        #[test]
        fn decode_covers_every_tagged_token_once(seq in prop::collection::vec(arbitrary_tag(), 0..40)) {
            let spans = decode(&seq);
            let mut covered = vec![0usize; seq.len()];
            for span in &spans {
                prop_assert!(span.start_token <= span.end_token);
                prop_assert!(span.end_token < seq.len());
                for slot in &mut covered[span.start_token..=span.end_token] {
                    *slot += 1;
                }
            }
            for (tag, count) in seq.iter().zip(&covered) {
                let expected = if *tag == Tag::Outside { 0 } else { 1 };
                prop_assert_eq!(*count, expected);
            }
        }

        /// decode(encode(spans)) devolve os mesmos spans.
        #[test]
        fn decode_inverts_encode(
            layout in prop::collection::vec((0usize..3, 1usize..4, "(a|b|cidade)"), 0..6),
            trailing in 0usize..3,
        ) {
            let mut spans = Vec::new();
            let mut cursor = 0;
            for (gap, len, label) in layout {
                let start = cursor + gap;
                spans.push(EntitySpan::new(start, start + len - 1, label));
                cursor = start + len;
            }
            let s = sentence(cursor + trailing);

            let encoded = encode(&s, &spans, Channel::Entity, TagScheme::Bilou);
            prop_assert_eq!(decode(&encoded), spans);
        }
    }
}
