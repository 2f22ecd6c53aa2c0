//! # Extrator de Entidades CRF — Orquestrador
//!
//! Coordena features, modelos por canal, resolução de confiança e
//! decodificação BILOU:
//!
//! 1. Extrai as features de cada token ([`FeatureExtractor`]).
//! 2. O canal de entidade prevê marginais; cada token recebe a tag mais
//!    provável ([`resolve_sequence`]).
//! 3. Os canais de papel e grupo recebem as mesmas features mais as tags de
//!    entidade da janela (`"{offset}:entity"`).
//! 4. Tags viram spans ([`decode_with_confidences`]); spans de papel/grupo
//!    contidos em uma entidade são anexados a ela.
//!
//! Um extrator treinado é imutável: `process` só lê e pode ser chamado de
//! várias threads ao mesmo tempo.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ExecutionContext, ExtractorConfig, PatternSpec};
use crate::confidence::resolve_sequence;
use crate::corpus::{Sentence, TrainingExample};
use crate::crf::{ChannelModel, CrfModel};
use crate::error::{Error, Result};
use crate::features::{FeatureExtractor, FeatureMap};
use crate::storage::{read_json, write_json, ModelStorage, Resource};
use crate::tagger::{decode_with_confidences, encode, Channel, EntitySpan, Tag};

/// Blob com os metadados do extrator.
pub const METADATA_BLOB: &str = "crf_extractor.json";
const FORMAT_VERSION: u32 = 1;

fn channel_blob(channel: Channel) -> String {
    format!("{}.crf.json", channel.name())
}

/// Entidade extraída de uma sentença.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub entity: String,
    /// Texto original coberto pela entidade.
    pub value: String,
    /// Offset de caractere inicial no texto.
    pub start: usize,
    /// Offset de caractere final (exclusivo).
    pub end: usize,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_role: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_group: Option<f64>,
}

/// O que é gravado junto com os modelos para reconstruir o extrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedMetadata {
    format_version: u32,
    features: Vec<Vec<String>>,
    #[serde(rename = "BILOU_flag")]
    bilou_flag: bool,
    patterns: Vec<PatternSpec>,
    channels: Vec<Channel>,
}

/// Extrator de entidades com um modelo de sequência por canal.
pub struct CrfEntityExtractor<M: ChannelModel = CrfModel> {
    config: ExtractorConfig,
    features: FeatureExtractor,
    models: BTreeMap<Channel, M>,
    storage: Arc<dyn ModelStorage>,
    resource: Resource,
}

impl<M: ChannelModel> CrfEntityExtractor<M> {
    /// Cria um extrator ainda não treinado. Falha com [`Error::Config`] se a
    /// configuração é inválida para o contexto.
    pub fn create(
        config: ExtractorConfig,
        storage: Arc<dyn ModelStorage>,
        resource: Resource,
        context: &ExecutionContext,
    ) -> Result<Self> {
        let features = config.validate(context)?;
        Ok(Self {
            config,
            features,
            models: BTreeMap::new(),
            storage,
            resource,
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Canais com modelo treinado.
    pub fn channels(&self) -> Vec<Channel> {
        self.models.keys().copied().collect()
    }

    pub fn is_trained(&self) -> bool {
        self.models.contains_key(&Channel::Entity)
    }

    /// Treina um modelo por canal presente nos dados e grava o resultado.
    ///
    /// Canais sem nenhum rótulo diferente de `O` são pulados. Os canais são
    /// treinados em paralelo; o primeiro erro aborta o treinamento todo.
    pub fn train(&mut self, examples: &[TrainingExample]) -> Result<()> {
        let examples: Vec<&TrainingExample> =
            examples.iter().filter(|e| !e.sentence.is_empty()).collect();
        let spans: Vec<Vec<EntitySpan>> = examples.iter().map(|e| e.entity_spans()).collect();

        let enabled: Vec<Channel> = Channel::ALL
            .into_iter()
            .filter(|channel| spans.iter().flatten().any(|s| channel.label_of(s).is_some()))
            .collect();

        if enabled.is_empty() {
            warn!(
                examples = examples.len(),
                "nenhuma entidade nos dados de treino; o extrator não vai extrair nada"
            );
            self.models.clear();
            return self.persist();
        }

        info!(
            examples = examples.len(),
            channels = ?enabled,
            "treinando extrator CRF"
        );

        let base: Vec<Vec<FeatureMap>> = examples
            .iter()
            .map(|e| self.features.extract(&e.sentence))
            .collect::<Result<_>>()?;

        let scheme = self.config.scheme();
        let tags_for = |channel: Channel| -> Vec<Vec<String>> {
            examples
                .iter()
                .zip(&spans)
                .map(|(e, s)| {
                    encode(&e.sentence, s, channel, scheme)
                        .iter()
                        .map(Tag::label)
                        .collect()
                })
                .collect()
        };
        let entity_tags = tags_for(Channel::Entity);

        let params = self.config.crf_params();
        let features = &self.features;
        let trained = enabled
            .par_iter()
            .map(|&channel| -> Result<(Channel, M)> {
                let tags = tags_for(channel);
                let channel_features: Cow<[Vec<FeatureMap>]> = match channel {
                    Channel::Entity => Cow::Borrowed(base.as_slice()),
                    Channel::Role | Channel::Group => Cow::Owned(
                        base.iter()
                            .zip(&entity_tags)
                            .map(|(f, t)| features.with_entity_tags(f, t))
                            .collect(),
                    ),
                };
                let model = M::train(&channel_features, &tags, &params)?;
                info!(channel = channel.name(), labels = model.labels().len(), "canal treinado");
                Ok((channel, model))
            })
            .collect::<Result<Vec<(Channel, M)>>>()?;

        self.models = trained.into_iter().collect();
        self.persist()
    }

    /// Grava metadados e um blob por canal.
    pub fn persist(&self) -> Result<()> {
        let metadata = PersistedMetadata {
            format_version: FORMAT_VERSION,
            features: self.config.features.clone(),
            bilou_flag: self.config.bilou_flag,
            patterns: self.config.patterns.clone(),
            channels: self.channels(),
        };
        let storage = self.storage.as_ref();
        write_json(storage, &self.resource, METADATA_BLOB, &metadata)?;
        for (channel, model) in &self.models {
            write_json(storage, &self.resource, &channel_blob(*channel), model)?;
        }
        info!(resource = %self.resource, channels = self.models.len(), "extrator gravado");
        Ok(())
    }

    /// Reconstrói um extrator treinado a partir do armazenamento.
    ///
    /// A extração de features vem dos metadados gravados, não de uma
    /// configuração nova: o extrator carregado produz exatamente as mesmas
    /// saídas que o extrator que foi treinado.
    pub fn load(
        storage: Arc<dyn ModelStorage>,
        resource: Resource,
        context: &ExecutionContext,
    ) -> Result<Self> {
        let metadata: PersistedMetadata = read_json(storage.as_ref(), &resource, METADATA_BLOB)?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(Error::storage(
                resource.name(),
                format!("versão de formato {} desconhecida", metadata.format_version),
            ));
        }

        let config = ExtractorConfig {
            features: metadata.features,
            bilou_flag: metadata.bilou_flag,
            patterns: metadata.patterns,
            ..ExtractorConfig::default()
        };
        let features = config.validate(context)?;

        let mut models = BTreeMap::new();
        for channel in metadata.channels {
            let model: M = read_json(storage.as_ref(), &resource, &channel_blob(channel))?;
            models.insert(channel, model);
        }
        info!(resource = %resource, channels = models.len(), "extrator carregado");

        Ok(Self {
            config,
            features,
            models,
            storage,
            resource,
        })
    }

    /// Extrai as entidades de uma sentença.
    ///
    /// Sem modelo de entidade (extrator não treinado ou treinado sem
    /// entidades) devolve lista vazia.
    pub fn process(&self, sentence: &Sentence) -> Result<Vec<ExtractedEntity>> {
        let Some(entity_model) = self.models.get(&Channel::Entity) else {
            return Ok(Vec::new());
        };
        if sentence.is_empty() {
            return Ok(Vec::new());
        }

        let base = self.features.extract(sentence)?;
        let (entity_tags, entity_confidences) =
            resolve_sequence(&entity_model.predict_marginals(&base));
        let tags: Vec<Tag> = entity_tags.iter().map(|t| Tag::from_label(t)).collect();
        let mut spans = decode_with_confidences(&tags, &entity_confidences);

        let mut attribute_confidences: BTreeMap<Channel, Vec<Option<f64>>> = BTreeMap::new();
        let has_attributes = self.models.keys().any(|c| *c != Channel::Entity);
        if has_attributes && !spans.is_empty() {
            let overlay = self.features.with_entity_tags(&base, &entity_tags);
            for channel in [Channel::Role, Channel::Group] {
                let Some(model) = self.models.get(&channel) else {
                    continue;
                };
                let (labels, confidences) = resolve_sequence(&model.predict_marginals(&overlay));
                let tags: Vec<Tag> = labels.iter().map(|t| Tag::from_label(t)).collect();
                let attributes = decode_with_confidences(&tags, &confidences);
                attribute_confidences.insert(channel, attach(&mut spans, &attributes, channel));
            }
        }

        let confidence_of = |channel: Channel, i: usize| {
            attribute_confidences
                .get(&channel)
                .and_then(|c| c.get(i).copied().flatten())
        };

        let entities: Vec<ExtractedEntity> = spans
            .into_iter()
            .enumerate()
            .map(|(i, span)| ExtractedEntity {
                value: sentence.span_text(span.start_token, span.end_token).to_string(),
                start: sentence.char_offset(sentence.tokens[span.start_token].start),
                end: sentence.char_offset(sentence.tokens[span.end_token].end),
                confidence: span.confidence,
                confidence_role: confidence_of(Channel::Role, i),
                confidence_group: confidence_of(Channel::Group, i),
                entity: span.entity,
                role: span.role,
                group: span.group,
            })
            .collect();

        debug!(tokens = sentence.len(), entities = entities.len(), "sentença processada");
        Ok(entities)
    }

    /// Processa várias sentenças em paralelo, preservando a ordem.
    pub fn process_batch(&self, sentences: &[Sentence]) -> Result<Vec<Vec<ExtractedEntity>>> {
        sentences.par_iter().map(|s| self.process(s)).collect()
    }
}

/// Anexa a cada entidade o span de papel/grupo mais confiante que ela
/// contém. Spans fora de qualquer entidade são descartados. Devolve a
/// confiança do atributo anexado a cada entidade.
fn attach(spans: &mut [EntitySpan], attributes: &[EntitySpan], channel: Channel) -> Vec<Option<f64>> {
    spans
        .iter_mut()
        .map(|span| {
            let best = attributes
                .iter()
                .filter(|a| span.contains(a))
                .fold(None, |best: Option<&EntitySpan>, a| match best {
                    Some(b) if b.confidence >= a.confidence => Some(b),
                    _ => Some(a),
                })?;
            match channel {
                Channel::Role => span.role = Some(best.entity.clone()),
                Channel::Group => span.group = Some(best.entity.clone()),
                Channel::Entity => return None,
            }
            Some(best.confidence)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{demo_corpus, EntityAnnotation};
    use crate::storage::FileModelStorage;
    use tempfile::{tempdir, TempDir};

    fn storage(dir: &TempDir) -> Arc<dyn ModelStorage> {
        Arc::new(FileModelStorage::new(dir.path()))
    }

    fn trained(config: ExtractorConfig) -> (TempDir, CrfEntityExtractor) {
        let dir = tempdir().unwrap();
        let mut extractor: CrfEntityExtractor = CrfEntityExtractor::create(
            config,
            storage(&dir),
            Resource::new("crf"),
            &ExecutionContext::new(),
        )
        .unwrap();
        extractor.train(&demo_corpus()).unwrap();
        (dir, extractor)
    }

    #[test]
    fn test_finds_cuisine() {
        let (_dir, extractor) = trained(ExtractorConfig::default());
        let sentence = Sentence::from_text("estou procurando um restaurante italiano");

        let entities = extractor.process(&sentence).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity, "culinaria");
        assert_eq!(entities[0].value, "italiano");
        assert_eq!((entities[0].start, entities[0].end), (32, 40));
        assert!(entities[0].confidence > 0.0 && entities[0].confidence <= 1.0 + 1e-9);
        assert_eq!(entities[0].role, None);
    }

    #[test]
    fn test_offsets_count_characters() {
        let (_dir, extractor) = trained(ExtractorConfig::default());
        let sentence = Sentence::from_text("voo saindo de Belém para Recife");

        let entities = extractor.process(&sentence).unwrap();
        let recife = entities.iter().find(|e| e.value == "Recife").unwrap();
        // "Belém" ocupa 6 bytes mas 5 caracteres
        assert_eq!((recife.start, recife.end), (25, 31));
        let chars: String = sentence
            .text
            .chars()
            .skip(recife.start)
            .take(recife.end - recife.start)
            .collect();
        assert_eq!(chars, "Recife");
    }

    fn span(start: usize, end: usize, label: &str, confidence: f64) -> EntitySpan {
        let mut span = EntitySpan::new(start, end, label);
        span.confidence = confidence;
        span
    }

    #[test]
    fn test_attach_keeps_most_confident_contained_span() {
        let mut entities = vec![
            span(0, 1, "cidade", 0.9),
            span(3, 3, "cidade", 0.8),
            span(5, 6, "cidade", 0.7),
        ];
        let roles = vec![
            span(0, 0, "origem", 0.4),
            span(1, 1, "destino", 0.6),
            // fora de qualquer entidade
            span(4, 4, "origem", 0.99),
            // só em parte dentro da terceira entidade
            span(6, 7, "destino", 0.95),
        ];

        let confidences = attach(&mut entities, &roles, Channel::Role);

        assert_eq!(entities[0].role.as_deref(), Some("destino"));
        assert_eq!(entities[1].role, None);
        assert_eq!(entities[2].role, None);
        assert_eq!(confidences, vec![Some(0.6), None, None]);
    }

    #[test]
    fn test_attach_group_ties_keep_first() {
        let mut entities = vec![span(0, 2, "sabor", 0.9)];
        let groups = vec![span(0, 0, "1", 0.5), span(2, 2, "2", 0.5)];

        let confidences = attach(&mut entities, &groups, Channel::Group);

        assert_eq!(entities[0].group.as_deref(), Some("1"));
        assert_eq!(entities[0].role, None);
        assert_eq!(confidences, vec![Some(0.5)]);
    }

    #[test]
    fn test_plain_scheme() {
        let config = ExtractorConfig {
            bilou_flag: false,
            ..Default::default()
        };
        let (_dir, extractor) = trained(config);
        let entities = extractor
            .process(&Sentence::from_text("estou procurando um restaurante italiano"))
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity, "culinaria");
    }

    #[test]
    fn test_roles_attached_to_entities() {
        let (_dir, extractor) = trained(ExtractorConfig::default());
        assert_eq!(
            extractor.channels(),
            vec![Channel::Entity, Channel::Role, Channel::Group]
        );

        let sentence = Sentence::from_text("quero um voo de Recife para Salvador");
        let entities = extractor.process(&sentence).unwrap();
        let found: Vec<(&str, &str, Option<&str>)> = entities
            .iter()
            .map(|e| (e.value.as_str(), e.entity.as_str(), e.role.as_deref()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("Recife", "cidade", Some("origem")),
                ("Salvador", "cidade", Some("destino")),
            ]
        );
        assert!(entities.iter().all(|e| e.confidence_role.is_some()));
    }

    #[test]
    fn test_groups_only_use_known_labels() {
        let (_dir, extractor) = trained(ExtractorConfig::default());
        let sentence = Sentence::from_text("quero uma pizza grande de calabresa e uma pequena de queijo");
        for entity in extractor.process(&sentence).unwrap() {
            if let Some(group) = &entity.group {
                assert!(group == "1" || group == "2");
                assert!(entity.confidence_group.is_some());
            }
        }
    }

    #[test]
    fn test_persist_and_load_give_same_output() {
        let (dir, extractor) = trained(ExtractorConfig::default());
        let loaded: CrfEntityExtractor =
            CrfEntityExtractor::load(storage(&dir), Resource::new("crf"), &ExecutionContext::new())
                .unwrap();

        let mut sentences: Vec<Sentence> =
            demo_corpus().into_iter().map(|e| e.sentence).collect();
        sentences.push(Sentence::from_text("quero um voo de Manaus para Fortaleza hoje"));
        sentences.push(Sentence::from_text("comida japonesa perto do centro"));

        for sentence in &sentences {
            assert_eq!(
                extractor.process(sentence).unwrap(),
                loaded.process(sentence).unwrap()
            );
        }
        assert_eq!(loaded.channels(), extractor.channels());
    }

    #[test]
    fn test_batch_matches_sequential() {
        let (_dir, extractor) = trained(ExtractorConfig::default());
        let sentences: Vec<Sentence> = demo_corpus().into_iter().map(|e| e.sentence).collect();

        let batch = extractor.process_batch(&sentences).unwrap();
        let sequential: Vec<_> = sentences
            .iter()
            .map(|s| extractor.process(s).unwrap())
            .collect();
        assert_eq!(batch, sequential);
    }

    #[test]
    fn test_without_entities_extracts_nothing() {
        let dir = tempdir().unwrap();
        let mut extractor: CrfEntityExtractor = CrfEntityExtractor::create(
            ExtractorConfig::default(),
            storage(&dir),
            Resource::new("vazio"),
            &ExecutionContext::new(),
        )
        .unwrap();
        let examples = vec![TrainingExample::new(Sentence::from_text("bom dia"), vec![])];
        extractor.train(&examples).unwrap();

        assert!(!extractor.is_trained());
        assert!(extractor.process(&Sentence::from_text("bom dia")).unwrap().is_empty());

        let loaded: CrfEntityExtractor =
            CrfEntityExtractor::load(storage(&dir), Resource::new("vazio"), &ExecutionContext::new())
                .unwrap();
        assert!(loaded.channels().is_empty());
    }

    #[test]
    fn test_empty_sentence() {
        let (_dir, extractor) = trained(ExtractorConfig::default());
        let empty = Sentence::from_text("");
        assert!(extractor.process(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected_at_creation() {
        let dir = tempdir().unwrap();
        let config = ExtractorConfig {
            features: vec![vec!["low".into()], vec!["low".into()]],
            ..Default::default()
        };
        let result: Result<CrfEntityExtractor> = CrfEntityExtractor::create(
            config,
            storage(&dir),
            Resource::new("crf"),
            &ExecutionContext::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    fn dense_config() -> ExtractorConfig {
        ExtractorConfig {
            features: vec![
                vec!["low".into()],
                vec!["low".into(), "bias".into(), "text_dense_features".into()],
                vec!["low".into()],
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_dense_features_abort_training() {
        let dir = tempdir().unwrap();
        let context = ExecutionContext::new().with_dense_featurizer("lexical");
        let mut extractor: CrfEntityExtractor =
            CrfEntityExtractor::create(dense_config(), storage(&dir), Resource::new("crf"), &context)
                .unwrap();

        let err = extractor.train(&demo_corpus()).unwrap_err();
        assert!(matches!(err, Error::MissingDenseFeatures { .. }));
    }

    #[test]
    fn test_trains_with_dense_features() {
        let dir = tempdir().unwrap();
        let context = ExecutionContext::new().with_dense_featurizer("lexical");
        let mut extractor: CrfEntityExtractor =
            CrfEntityExtractor::create(dense_config(), storage(&dir), Resource::new("crf"), &context)
                .unwrap();

        let with_dense = |mut sentence: Sentence| {
            for token in &mut sentence.tokens {
                let title = if token.text.chars().next().is_some_and(char::is_uppercase) {
                    1.0
                } else {
                    0.0
                };
                token.dense = Some(vec![token.text.chars().count() as f64 / 10.0, title]);
            }
            sentence
        };
        let examples: Vec<TrainingExample> = demo_corpus()
            .into_iter()
            .map(|e| TrainingExample::new(with_dense(e.sentence), e.entities))
            .collect();
        extractor.train(&examples).unwrap();

        let sentence = with_dense(Sentence::from_text("quero um voo de Recife para Salvador"));
        let entities = extractor.process(&sentence).unwrap();
        assert!(entities.iter().any(|e| e.value == "Recife"));
    }

    #[test]
    fn test_load_failures_are_storage_errors() {
        let dir = tempdir().unwrap();
        let missing: Result<CrfEntityExtractor> =
            CrfEntityExtractor::load(storage(&dir), Resource::new("nada"), &ExecutionContext::new());
        assert!(matches!(missing, Err(Error::Storage { .. })));

        let store = storage(&dir);
        let resource = Resource::new("futuro");
        let metadata = serde_json::json!({
            "format_version": 99,
            "features": [["low"]],
            "BILOU_flag": true,
            "patterns": [],
            "channels": []
        });
        write_json(store.as_ref(), &resource, METADATA_BLOB, &metadata).unwrap();
        let future: Result<CrfEntityExtractor> =
            CrfEntityExtractor::load(store.clone(), resource, &ExecutionContext::new());
        assert!(matches!(future, Err(Error::Storage { .. })));

        let resource = Resource::new("corrompido");
        let metadata = serde_json::json!({
            "format_version": 1,
            "features": [["low"]],
            "BILOU_flag": true,
            "patterns": [],
            "channels": ["entity"]
        });
        write_json(store.as_ref(), &resource, METADATA_BLOB, &metadata).unwrap();
        store
            .write_blob(&resource, "entity.crf.json", b"{\"labels\": 3")
            .unwrap();
        let corrupt: Result<CrfEntityExtractor> =
            CrfEntityExtractor::load(store, resource, &ExecutionContext::new());
        assert!(matches!(corrupt, Err(Error::Storage { .. })));
    }

    #[test]
    fn test_misaligned_annotation_still_trains() {
        let dir = tempdir().unwrap();
        let mut extractor: CrfEntityExtractor = CrfEntityExtractor::create(
            ExtractorConfig::default(),
            storage(&dir),
            Resource::new("crf"),
            &ExecutionContext::new(),
        )
        .unwrap();
        // "ital" termina no meio do token
        let examples = vec![TrainingExample::new(
            Sentence::from_text("restaurante italiano"),
            vec![EntityAnnotation::new(12, 16, "ital", "culinaria")],
        )];
        extractor.train(&examples).unwrap();
        assert!(extractor.is_trained());
    }
}
