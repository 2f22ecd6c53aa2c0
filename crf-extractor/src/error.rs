//! Tipos de erro do extrator.
//!
//! Só existem três famílias de falha: configuração (detectada na criação),
//! dados de treino incompatíveis com a configuração e armazenamento. Todo o
//! resto (features, inferência, resolução de confiança, decodificação BILOU)
//! é total sobre o domínio de entrada.

use thiserror::Error;

/// Resultado padrão das operações do crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Configuração inválida: o componente não pode ser construído.
    #[error("configuração inválida: {0}")]
    Config(String),

    /// `text_dense_features` foi pedido, mas o token não tem vetor denso.
    #[error(
        "token {token_index} ('{token}') não possui features densas, mas 'text_dense_features' está configurado"
    )]
    MissingDenseFeatures { token_index: usize, token: String },

    /// Falha que aborta um treinamento (sem nova tentativa).
    #[error("falha no treinamento: {0}")]
    Training(String),

    /// Artefato ausente, corrompido ou incompatível. Não é recuperável.
    #[error("falha de armazenamento em '{resource}': {reason}")]
    Storage { resource: String, reason: String },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Error::Training(msg.into())
    }

    pub fn storage(resource: impl Into<String>, reason: impl ToString) -> Self {
        Error::Storage {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}
