//! # Forward-Backward — Marginais de um CRF Linear-Chain
//!
//! Em vez de escolher uma única sequência (Viterbi), o extrator precisa da
//! probabilidade de cada rótulo em cada token: `P(y_i = t | x)`. O algoritmo
//! forward-backward calcula todas essas marginais em `O(N × T²)`.
//!
//! ## Algoritmo (em espaço log)
//!
//! ```text
//! α[0][t]  = emission[0][t]
//! α[i][t]  = emission[i][t] + logsumexp_{t'} (α[i-1][t'] + transition[t'][t])
//! β[N-1][t] = 0
//! β[i][t]  = logsumexp_{t'} (transition[t][t'] + emission[i+1][t'] + β[i+1][t'])
//! log Z    = logsumexp_t α[N-1][t]
//! P(y_i = t | x) = exp(α[i][t] + β[i][t] - log Z)
//! ```
//!
//! Trabalhar em espaço log evita underflow em sentenças longas.

/// Resultado do forward-backward para uma sequência.
#[derive(Debug, Clone, PartialEq)]
pub struct Marginals {
    /// Log da função de partição `Z(x)`.
    pub log_z: f64,
    /// `nodes[i][t]` = P(y_i = t | x)
    pub nodes: Vec<Vec<f64>>,
    /// `transitions[p][t]` = Σ_i P(y_{i-1} = p, y_i = t | x): contagem esperada
    /// de cada transição, usada no gradiente do treinamento.
    pub transitions: Vec<Vec<f64>>,
}

/// `log(Σ exp(v))` estável: subtrai o máximo antes de exponenciar.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Executa forward-backward.
///
/// `emissions[i][t]` é o score (não normalizado) da tag `t` no token `i`;
/// `transitions[p][t]` é o score da transição `p → t`.
pub fn forward_backward(emissions: &[Vec<f64>], transitions: &[Vec<f64>]) -> Marginals {
    let n_tokens = emissions.len();
    let n_tags = transitions.len();

    if n_tokens == 0 || n_tags == 0 {
        return Marginals {
            log_z: 0.0,
            nodes: vec![Vec::new(); n_tokens],
            transitions: vec![vec![0.0; n_tags]; n_tags],
        };
    }

    let mut scratch = vec![0.0; n_tags];

    // === Forward ===
    let mut alpha = vec![vec![0.0; n_tags]; n_tokens];
    alpha[0].copy_from_slice(&emissions[0]);
    for i in 1..n_tokens {
        for t in 0..n_tags {
            for p in 0..n_tags {
                scratch[p] = alpha[i - 1][p] + transitions[p][t];
            }
            alpha[i][t] = emissions[i][t] + log_sum_exp(&scratch);
        }
    }

    // === Backward ===
    let mut beta = vec![vec![0.0; n_tags]; n_tokens];
    for i in (0..n_tokens - 1).rev() {
        for t in 0..n_tags {
            for next in 0..n_tags {
                scratch[next] = transitions[t][next] + emissions[i + 1][next] + beta[i + 1][next];
            }
            beta[i][t] = log_sum_exp(&scratch);
        }
    }

    let log_z = log_sum_exp(&alpha[n_tokens - 1]);

    let nodes = (0..n_tokens)
        .map(|i| {
            (0..n_tags)
                .map(|t| (alpha[i][t] + beta[i][t] - log_z).exp())
                .collect()
        })
        .collect();

    let mut expected = vec![vec![0.0; n_tags]; n_tags];
    for i in 1..n_tokens {
        for p in 0..n_tags {
            for t in 0..n_tags {
                expected[p][t] +=
                    (alpha[i - 1][p] + transitions[p][t] + emissions[i][t] + beta[i][t] - log_z)
                        .exp();
            }
        }
    }

    Marginals {
        log_z,
        nodes,
        transitions: expected,
    }
}
