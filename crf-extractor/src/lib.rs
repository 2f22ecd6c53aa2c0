//! # crf-extractor — Extração de Entidades com CRF Linear
//!
//! Este crate identifica entidades em sentenças já tokenizadas e, para
//! entidades compostas, também o **papel** (ex: cidade de origem ou destino)
//! e o **grupo** (ex: tamanho e sabor do mesmo item de um pedido).
//!
//! ## Arquitetura
//!
//! 1.  **Entrada**: [`Sentence`] com tokens (POS e vetor denso opcionais).
//! 2.  **Features** ([`features`]): janela de funções configuráveis por token (`"-1:low"`, `"0:suffix3"`, ...).
//! 3.  **Modelos** ([`crf`]): um CRF linear por canal (entidade, papel, grupo), com marginais via
//!     forward-backward ([`inference`]).
//! 4.  **Confiança** ([`confidence`]): escolha da tag por token agrupando prefixos BILOU.
//! 5.  **Decodificação** ([`tagger`]): tags BILOU → spans, tolerante a sequências malformadas.
//! 6.  **Saída**: lista de [`ExtractedEntity`] com valor, offsets de caractere, confiança, papel e grupo.
//!
//! ## Exemplo de Uso
//!
//! ```rust
//! use std::sync::Arc;
//! use crf_extractor::{
//!     demo_corpus, CrfEntityExtractor, ExecutionContext, ExtractorConfig, FileModelStorage,
//!     Resource, Sentence,
//! };
//!
//! let dir = tempfile::tempdir()?;
//! let storage = Arc::new(FileModelStorage::new(dir.path()));
//!
//! // 1. Cria e treina (os modelos são gravados no armazenamento)
//! let mut extractor: CrfEntityExtractor = CrfEntityExtractor::create(
//!     ExtractorConfig::default(),
//!     storage,
//!     Resource::new("crf_extractor"),
//!     &ExecutionContext::new(),
//! )?;
//! extractor.train(&demo_corpus())?;
//!
//! // 2. Extrai entidades
//! let sentence = Sentence::from_text("quero um voo de Recife para Salvador");
//! for entity in extractor.process(&sentence)? {
//!     println!("{} = {} ({:?}) {:.2}", entity.entity, entity.value, entity.role, entity.confidence);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Módulos Principais
//!
//! - [`extractor`]: Orquestrador (criar, treinar, gravar, carregar, processar).
//! - [`config`]: Configuração e validação.
//! - [`storage`]: Persistência dos artefatos treinados.
//! - [`corpus`]: Tipos de entrada, alinhamento de anotações e corpus de demonstração.

pub mod confidence;
pub mod config;
pub mod corpus;
pub mod crf;
pub mod error;
pub mod extractor;
pub mod features;
pub mod inference;
pub mod storage;
pub mod tagger;
pub mod tokenizer;

pub use config::{ExecutionContext, ExtractorConfig, PatternSpec};
pub use corpus::{demo_corpus, EntityAnnotation, Sentence, TrainingExample};
pub use crf::{ChannelModel, CrfModel, CrfParams, LabelProbabilities};
pub use error::{Error, Result};
pub use extractor::{CrfEntityExtractor, ExtractedEntity};
pub use features::{FeatureExtractor, FeatureFunction, FeatureMap, FeatureValue};
pub use storage::{FileModelStorage, ModelStorage, Resource};
pub use tagger::{Channel, EntitySpan, Tag, TagScheme};
pub use tokenizer::Token;
