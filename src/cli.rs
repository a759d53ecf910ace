//! Interface de linha de comando do atelier baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo, costs)
//! e flags globais (--config, --workers, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::job::{JobKind, Tier};

/// atelier: controle de admissão e orquestração de tarefas de imagem IA.
#[derive(Debug, Parser)]
#[command(name = "atelier", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./atelier.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número de workers, sobrepõe `queue.workers`.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Tipo de job aceito pela CLI, mapeado para [`JobKind`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Provador virtual.
    TryOn,
    /// Análise de pele.
    SkinAnalysis,
    /// Simulação de envelhecimento.
    Aging,
    /// Geração de estilo.
    StyleGeneration,
}

impl From<KindArg> for JobKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::TryOn => JobKind::TryOn,
            KindArg::SkinAnalysis => JobKind::SkinAnalysis,
            KindArg::Aging => JobKind::Aging,
            KindArg::StyleGeneration => JobKind::StyleGeneration,
        }
    }
}

/// Camada da fila.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    High,
    Normal,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::High => Tier::High,
            TierArg::Normal => Tier::Normal,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Admite e executa um único job pelo engine completo.
    Run {
        /// Tipo do job.
        kind: KindArg,

        /// Conta que paga pelo job.
        #[arg(long)]
        account: String,

        /// Saldo concedido à conta antes da admissão.
        #[arg(long)]
        balance: f64,

        #[arg(long, value_enum, default_value_t = TierArg::Normal)]
        tier: TierArg,

        /// Arquivo de entrada (imagem) enviado ao provedor.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Desliga os passes de refinamento para este job.
        #[arg(long, default_value_t = false)]
        no_refine: bool,
    },

    /// Executa a demonstração embutida com o provedor determinístico.
    Demo {
        /// Quantidade de jobs enfileirados.
        #[arg(long, default_value_t = 8)]
        jobs: usize,
    },

    /// Mostra a tabela de custos configurada.
    Costs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "atelier",
            "run",
            "try-on",
            "--account",
            "acct-1",
            "--balance",
            "10",
            "--tier",
            "high",
        ]);
        match cli.command {
            Command::Run {
                kind,
                account,
                balance,
                tier,
                input,
                no_refine,
            } => {
                assert_eq!(JobKind::from(kind), JobKind::TryOn);
                assert_eq!(account, "acct-1");
                assert_eq!(balance, 10.0);
                assert_eq!(Tier::from(tier), Tier::High);
                assert!(input.is_none());
                assert!(!no_refine);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "atelier",
            "--config",
            "custom.toml",
            "--workers",
            "2",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.workers, Some(2));
        assert_eq!(cli.config.unwrap(), PathBuf::from("custom.toml"));
        assert!(matches!(cli.command, Command::Demo { jobs: 8 }));
    }

    #[test]
    fn run_requires_account() {
        let result = Cli::try_parse_from(["atelier", "run", "aging", "--balance", "3"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
