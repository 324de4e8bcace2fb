//! Configuração do stocksmith carregada a partir de `stocksmith.toml`.
//!
//! A struct [`StocksmithConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::StocksmithError;
use crate::lock::LockPolicy;

/// Configuração de nível superior carregada de `stocksmith.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct StocksmithConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Modelo usado para gerar metadados.
    #[serde(default = "default_model")]
    pub model: String,

    /// Limite de tokens por resposta do modelo.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Caminho do catálogo CSV de mídia.
    #[serde(default = "default_catalog")]
    pub catalog: String,

    /// Diretório de estado (registro, lotes, lock).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Nome do provedor, usado na chave de quota diária.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Número máximo de arquivos por lote.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Tempo máximo de espera por um job, em segundos. Zero espera sem limite.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Intervalo entre consultas de status, em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Máximo de jobs submetidos por provedor por dia.
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,

    /// Dias que lotes concluídos permanecem antes da limpeza.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Idade em segundos a partir da qual um lock é considerado obsoleto.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,

    /// Se o processo dono do lock deve ser verificado.
    #[serde(default = "default_probe_lock_process")]
    pub probe_lock_process: bool,

    /// Timeouts de espera acumulados antes de cancelar o job remoto.
    #[serde(default = "default_max_poll_timeouts")]
    pub max_poll_timeouts: u32,
}

// Valor padrão para o modelo: sonnet atual.
fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

// Valor padrão para max_tokens: 1024.
fn default_max_tokens() -> u32 {
    1024
}

// Valor padrão para o catálogo: media_catalog.csv.
fn default_catalog() -> String {
    "media_catalog.csv".to_string()
}

// Valor padrão para o diretório de estado: .stocksmith.
fn default_data_dir() -> String {
    ".stocksmith".to_string()
}

// Valor padrão para o provedor: anthropic.
fn default_provider() -> String {
    "anthropic".to_string()
}

// Valor padrão para o tamanho de lote: 20.
fn default_batch_size() -> u32 {
    20
}

// Valor padrão para a espera: 1800s (30 minutos).
fn default_wait_timeout_secs() -> u64 {
    1800
}

// Valor padrão para o intervalo de consulta: 30s.
fn default_poll_interval_secs() -> u64 {
    30
}

// Valor padrão para a quota diária: 10 jobs.
fn default_daily_cap() -> u32 {
    10
}

// Valor padrão para a retenção: 30 dias.
fn default_retention_days() -> u32 {
    30
}

// Valor padrão para lock obsoleto: 3600s (1 hora).
fn default_lock_stale_secs() -> u64 {
    3600
}

// Por padrão o processo dono do lock é verificado.
fn default_probe_lock_process() -> bool {
    true
}

// Valor padrão para timeouts acumulados: 6.
fn default_max_poll_timeouts() -> u32 {
    6
}

impl Default for StocksmithConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            catalog: default_catalog(),
            data_dir: default_data_dir(),
            provider: default_provider(),
            batch_size: default_batch_size(),
            wait_timeout_secs: default_wait_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            daily_cap: default_daily_cap(),
            retention_days: default_retention_days(),
            lock_stale_secs: default_lock_stale_secs(),
            probe_lock_process: default_probe_lock_process(),
            max_poll_timeouts: default_max_poll_timeouts(),
        }
    }
}

impl StocksmithConfig {
    /// Carrega a configuração de `stocksmith.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, StocksmithError> {
        let path = Path::new("stocksmith.toml");
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<StocksmithConfig>(&contents)
                .map_err(|err| StocksmithError::Config(format!("stocksmith.toml: {err}")))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    /// Caminho do arquivo de lock dentro do diretório de estado.
    pub fn lock_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("stocksmith.lock")
    }

    /// Política de lock derivada da configuração.
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            stale_after: Duration::from_secs(self.lock_stale_secs),
            probe_process: self.probe_lock_process,
        }
    }
}
