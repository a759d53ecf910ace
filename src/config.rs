//! Configuração do atelier carregada a partir de `atelier.toml`.
//!
//! A struct [`EngineConfig`] agrupa todos os parâmetros configuráveis por
//! seção (`[provider]`, `[rate_limit]`, `[retry]`, `[poll]`, `[queue]`,
//! `[costs]`, `[pipeline]`). Valores ausentes no arquivo usam defaults
//! sensíveis. A variável de ambiente `ATELIER_API_KEY` tem precedência
//! sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credits::Credits;
use crate::error::EngineError;
use crate::job::JobKind;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "atelier.toml";

/// Variável de ambiente que sobrepõe `provider.api_key`.
pub const API_KEY_ENV: &str = "ATELIER_API_KEY";

/// Configuração de nível superior carregada de `atelier.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub queue: QueueConfig,
    pub costs: CostConfig,
    pub pipeline: PipelineConfig,
}

/// Qual implementação de provedor usar. Escolhida uma única vez na construção.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Provedor determinístico em processo (demo e testes).
    #[default]
    Fixture,
    /// Cliente HTTP real.
    Live,
}

/// Parâmetros de conexão com o provedor externo.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub mode: ProviderMode,
    pub base_url: String,
    /// Chave da API do provedor.
    pub api_key: String,
    /// Timeout rígido por chamada, em milissegundos.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Fixture,
            base_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Janela deslizante compartilhada contra a cota do provedor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Máximo de chamadas dentro da janela.
    pub max_calls: u32,
    pub window_ms: u64,
    /// Intervalo mínimo entre duas chamadas consecutivas.
    pub min_interval_ms: u64,
    /// Tempo máximo de espera por um slot antes de `RateLimitTimeout`.
    pub max_wait_ms: u64,
    /// Número máximo de re-verificações durante a espera.
    pub max_retries: u32,
    /// Consultas de status também passam pela janela.
    pub limit_status_queries: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 10,
            window_ms: 60_000,
            min_interval_ms: 500,
            max_wait_ms: 30_000,
            max_retries: 10,
            limit_status_queries: false,
        }
    }
}

/// Retentativas de chamadas remotas com backoff exponencial.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Atraso base em milissegundos para backoff exponencial.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter aleatório máximo somado a cada atraso calculado.
    pub jitter_ms: u64,
    /// Status adicionais tratados como transitórios (além de 5xx e 429).
    pub retryable_statuses: Vec<u16>,
    /// Teto para esperas pedidas pelo provedor (`retry-after`).
    pub max_retry_after_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 250,
            retryable_statuses: Vec::new(),
            max_retry_after_ms: 60_000,
        }
    }
}

/// Polling de tarefas assíncronas do provedor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_attempts: u32,
    /// Intervalo usado quando o provedor não sugere um.
    pub default_interval_ms: u64,
    /// Teto para o intervalo sugerido pelo provedor.
    pub max_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            default_interval_ms: 2000,
            max_interval_ms: 10_000,
        }
    }
}

/// Fila de jobs em camadas e workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    /// Quantos jobs `high` são servidos por rodada.
    pub high_weight: u32,
    /// Quantos jobs `normal` são servidos por rodada.
    pub normal_weight: u32,
    /// Tentativas de um job em caso de falha do worker.
    pub job_max_attempts: u32,
    pub requeue_base_delay_ms: u64,
    /// Idade após a qual jobs terminais saem do índice da fila.
    pub remove_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            high_weight: 3,
            normal_weight: 1,
            job_max_attempts: 3,
            requeue_base_delay_ms: 1000,
            remove_after_secs: 86_400,
        }
    }
}

/// Custo em créditos de cada tipo de job. Política de negócio, não constante.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub try_on: Credits,
    pub skin_analysis: Credits,
    pub aging: Credits,
    pub style_generation: Credits,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            try_on: Credits::whole(3),
            skin_analysis: Credits::whole(1),
            aging: Credits::whole(2),
            style_generation: Credits::whole(2),
        }
    }
}

impl CostConfig {
    pub fn cost_of(&self, kind: JobKind) -> Credits {
        match kind {
            JobKind::TryOn => self.try_on,
            JobKind::SkinAnalysis => self.skin_analysis,
            JobKind::Aging => self.aging,
            JobKind::StyleGeneration => self.style_generation,
        }
    }
}

/// Seleção do pipeline por requisição.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Habilita os passes de refinamento local.
    pub refine: bool,
    /// Passes de refinamento, na ordem de execução.
    pub passes: Vec<String>,
    pub signed_url_ttl_secs: u64,
    pub max_artifact_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refine: true,
            passes: vec![
                "size-guard".to_string(),
                "strip-metadata".to_string(),
                "content-digest".to_string(),
            ],
            signed_url_ttl_secs: 3600,
            max_artifact_bytes: 20 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `atelier.toml` no diretório atual, ou do
    /// caminho fornecido. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<EngineConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.is_empty()
        {
            config.provider.api_key = key;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações sem sentido antes de construir o engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.rate_limit.max_calls == 0 {
            return invalid("rate_limit.max_calls must be at least 1");
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.window_ms must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.poll.max_attempts == 0 {
            return invalid("poll.max_attempts must be at least 1");
        }
        if self.queue.workers == 0 {
            return invalid("queue.workers must be at least 1");
        }
        if self.queue.high_weight == 0 || self.queue.normal_weight == 0 {
            return invalid("queue weights must be at least 1 so no tier starves");
        }
        if self.queue.job_max_attempts == 0 {
            return invalid("queue.job_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.provider.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.provider.mode, ProviderMode::Fixture);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.queue.high_weight, 3);
        assert_eq!(config.costs.cost_of(JobKind::TryOn), Credits::whole(3));
        assert!(config.provider.api_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [provider]
            mode = "live"
            api_key = "sk-test-123"

            [retry]
            max_attempts = 5

            [costs]
            try_on = 2.5
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.provider.mode, ProviderMode::Live);
        assert_eq!(config.provider.api_key, "sk-test-123");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.costs.try_on, Credits::from_millis(2500));
        assert_eq!(config.costs.aging, Credits::whole(2));
        assert_eq!(config.poll.max_attempts, 60);
    }

    #[test]
    fn validate_rejects_starving_weights() {
        let mut config = EngineConfig::default();
        config.queue.normal_weight = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_delays() {
        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nworkers = 7").unwrap();
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.queue.workers, 7);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rate_limit]\nmax_calls = 0").unwrap();
        assert!(EngineConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = EngineConfig::load(Some(&missing)).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
