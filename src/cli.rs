//! Interface de linha de comando do LECTERN baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, import, run,
//! status, controles de job) e flags globais (--model, --max-retries,
//! --verbose, --config).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::course::PipelineKind;

/// LECTERN: orquestrador em lote de conteúdo gerado para cursos.
#[derive(Debug, Parser)]
#[command(name = "lectern", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Modelo primário usado nesta sessão (sobrescreve `active_model`).
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Número máximo de passadas de retentativa por lição.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Caminho do arquivo de configuração TOML.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Pipeline aceito pela CLI, mapeado para [`PipelineKind`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PipelineArg {
    /// Curadoria de fontes externas por lição.
    Sources,
    /// Geração de materiais da lição.
    Materials,
}

impl From<PipelineArg> for PipelineKind {
    fn from(arg: PipelineArg) -> Self {
        match arg {
            PipelineArg::Sources => PipelineKind::Sources,
            PipelineArg::Materials => PipelineKind::Materials,
        }
    }
}

/// Decisão de QA sobre um job finalizado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sobe o servidor HTTP de disparo e acompanhamento.
    Serve {
        /// Endereço de escuta (sobrescreve `bind_addr`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Importa um plano de curso (JSON) para o store.
    Import {
        /// Caminho do arquivo JSON com o plano.
        file: PathBuf,
    },

    /// Executa um job em primeiro plano, exibindo o progresso.
    Run {
        /// Identificador do curso.
        artifact_id: String,

        /// Identificador do job. Gerado se omitido.
        #[arg(long)]
        job_id: Option<String>,

        #[arg(long, value_enum, default_value_t = PipelineArg::Sources)]
        pipeline: PipelineArg,

        /// Instrução extra anexada ao prompt de sistema.
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Reexecuta do zero o job mais recente de um curso.
    Retrigger {
        artifact_id: String,

        #[arg(long, value_enum, default_value_t = PipelineArg::Sources)]
        pipeline: PipelineArg,
    },

    /// Retoma um job pausado.
    Resume { job_id: String },

    /// Mostra o status de um job e de suas lições.
    Status {
        job_id: String,

        /// Imprime o snapshot completo em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Pede a pausa de um job na próxima fronteira de lote.
    Pause { job_id: String },

    /// Pede a parada de um job.
    Stop {
        job_id: String,

        /// Para imediatamente, sem esperar a fronteira de lote.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Registra a decisão de QA de um job finalizado.
    Review {
        job_id: String,

        #[arg(value_enum)]
        decision: Decision,
    },
}
