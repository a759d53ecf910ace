//! Interface de terminal do atelier: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::CostConfig;
use crate::error::EngineError;
use crate::job::{AuditRecord, Job, JobKind, JobStatus};
use crate::ledger::AccountSnapshot;

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e degradação (amarelo).
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com o tipo do job e a conta que paga por ele.
    pub fn start(kind: JobKind, account_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{kind} for {account_id}: queued"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner.
    pub fn update(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    ///
    /// Sucesso é mostrado em verde com checkmark; sucesso sem refinamento em
    /// amarelo; falha em vermelho com X e a orientação ao usuário.
    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match (job.status, job.error_kind) {
            (JobStatus::Succeeded, _) if job.refined => {
                println!("  {} Job {} succeeded", self.green.apply_to("✓"), job.id);
            }
            (JobStatus::Succeeded, _) => {
                println!(
                    "  {} Job {} succeeded without refinement",
                    self.yellow.apply_to("✓"),
                    job.id
                );
            }
            (_, Some(kind)) => {
                println!(
                    "  {} Job {} failed ({kind}): {}",
                    self.red.apply_to("✗"),
                    job.id,
                    kind.guidance()
                );
            }
            (status, None) => {
                println!("  {} Job {} is {status}", self.yellow.apply_to("…"), job.id);
            }
        }
    }

    /// Finaliza o spinner quando o job nem chegou a ser admitido.
    pub fn reject(&self, err: &EngineError) {
        self.pb.finish_and_clear();
        println!(
            "  {} Rejected: {err} ({})",
            self.red.apply_to("✗"),
            err.kind().guidance()
        );
    }

    /// Imprime o registro de auditoria formatado em JSON com estilo colorido.
    pub fn print_audit(&self, record: &AuditRecord) {
        print_audit(record);
    }
}

/// Uma linha por job, usada no resumo da demonstração.
pub fn print_summary(job: &Job) {
    let style = status_style(job.status);
    let detail = match (&job.error_kind, &job.error_message) {
        (Some(kind), Some(message)) => format!("{kind}: {message}"),
        _ if job.refined => "refined".to_string(),
        _ => job.steps_applied.join(" → "),
    };
    println!(
        "  {:<9} {:<6} {:<16} {:<8} {}",
        style.apply_to(job.status.to_string()),
        job.tier.to_string(),
        job.kind.to_string(),
        job.account_id,
        detail
    );
}

/// Imprime um registro de auditoria sem spinner ativo.
pub fn print_audit(record: &AuditRecord) {
    let style = status_style(record.status);
    println!();
    println!("{}", style.apply_to("─── Audit Record ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// Imprime o saldo de uma conta.
pub fn print_balance(account_id: &str, snapshot: &AccountSnapshot) {
    let label = Style::new().bold();
    println!(
        "  {} balance={} reserved={} available={}{}",
        label.apply_to(account_id),
        snapshot.balance,
        snapshot.reserved,
        snapshot.available,
        if snapshot.unlimited { " (unlimited)" } else { "" }
    );
}

/// Imprime a tabela de custos por tipo de job.
pub fn print_costs(costs: &CostConfig) {
    let header = Style::new().cyan().bold();
    println!("{}", header.apply_to("─── Costs (credits) ───"));
    for kind in JobKind::ALL {
        println!("  {:<18} {}", kind.to_string(), costs.cost_of(kind));
    }
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Succeeded => Style::new().green(),
        JobStatus::Failed => Style::new().red(),
        JobStatus::Queued | JobStatus::Running => Style::new().yellow(),
    }
}
