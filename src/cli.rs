//! Interface de linha de comando do stocksmith baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, cancel,
//! cleanup) e a flag global --verbose.

use clap::{Parser, Subcommand};

/// stocksmith — Coordenador de lotes de metadados para mídia de banco de imagens.
#[derive(Debug, Parser)]
#[command(name = "stocksmith", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa uma rodada: coleta, submete e ingere lotes.
    Run {
        /// Arquivos específicos a processar. Vazio usa o catálogo.
        paths: Vec<String>,

        /// Número máximo de arquivos por lote nesta rodada.
        #[arg(long)]
        batch_size: Option<u32>,

        /// Espera máxima por job em segundos. Zero espera sem limite.
        #[arg(long)]
        wait_timeout: Option<u64>,

        /// Intervalo entre consultas de status, em segundos.
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Submete também lotes parcialmente preenchidos.
        #[arg(long, default_value_t = false)]
        flush: bool,

        /// Coleta em um lote de efeito alternativo com este nome.
        #[arg(long)]
        effect: Option<String>,
    },

    /// Mostra os lotes ativos e os totais do dia.
    Status,

    /// Cancels a batch and releases its file claims.
    Cancel {
        /// Id do lote a cancelar.
        batch_id: String,
    },

    /// Remove lotes concluídos além da janela de retenção.
    Cleanup {
        /// Dias de retenção a aplicar nesta chamada.
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_with_paths_and_flags() {
        let cli = Cli::parse_from([
            "stocksmith",
            "run",
            "a.jpg",
            "b.jpg",
            "--flush",
            "--batch-size",
            "5",
            "--effect",
            "vintage",
        ]);
        match cli.command {
            Command::Run {
                paths,
                batch_size,
                flush,
                effect,
                ..
            } => {
                assert_eq!(paths, ["a.jpg", "b.jpg"]);
                assert_eq!(batch_size, Some(5));
                assert!(flush);
                assert_eq!(effect.as_deref(), Some("vintage"));
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_zero_wait_timeout() {
        let cli = Cli::parse_from(["stocksmith", "run", "--wait-timeout", "0"]);
        match cli.command {
            Command::Run { wait_timeout, .. } => assert_eq!(wait_timeout, Some(0)),
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_cancel_with_batch_id() {
        let cli = Cli::parse_from(["stocksmith", "cancel", "batch-123"]);
        match cli.command {
            Command::Cancel { batch_id } => assert_eq!(batch_id, "batch-123"),
            _ => panic!("expected Cancel command"),
        }
    }

    #[test]
    fn cli_parses_cleanup_retention_override() {
        let cli = Cli::parse_from(["stocksmith", "cleanup", "--retention-days", "7"]);
        match cli.command {
            Command::Cleanup { retention_days } => assert_eq!(retention_days, Some(7)),
            _ => panic!("expected Cleanup command"),
        }
    }

    #[test]
    fn cli_parses_global_verbose() {
        let cli = Cli::parse_from(["stocksmith", "--verbose", "status"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
