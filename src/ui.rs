//! Interface de terminal do LECTERN: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para o progresso das lições e `console` para estilização
//! com cores. O [`JobProgress`] observa o snapshot de um job enquanto ele roda.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::{AuditRecord, JobSnapshot};
use crate::state_machine::{JobStatus, LessonStatus, WorkItem};

/// Quantas lições já saíram da fila (nem pendentes, nem em andamento).
pub fn settled(items: &[WorkItem]) -> u64 {
    items
        .iter()
        .filter(|i| i.status != LessonStatus::Pending && !i.status.is_in_progress())
        .count() as u64
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::ReadyForQa | JobStatus::Approved => Style::new().green().bold(),
        JobStatus::NeedsFix | JobStatus::Rejected | JobStatus::Stopped => {
            Style::new().red().bold()
        }
        _ => Style::new().yellow(),
    }
}

fn lesson_style(status: LessonStatus) -> Style {
    match status {
        LessonStatus::Approvable => Style::new().green(),
        LessonStatus::NeedsFix | LessonStatus::Blocked => Style::new().red(),
        _ => Style::new().dim(),
    }
}

/// Indicador visual de progresso para a execução de um job no terminal.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
}

impl JobProgress {
    /// Inicia a barra com o total de lições do job.
    pub fn start(job_id: &str, lessons: usize) -> Self {
        let pb = ProgressBar::new(lessons as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(format!("{job_id}: DRAFT"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Atualiza a barra a partir do snapshot mais recente.
    pub fn observe(&self, snapshot: &JobSnapshot) {
        self.pb.set_length(snapshot.items.len() as u64);
        self.pb.set_position(settled(&snapshot.items));
        self.pb
            .set_message(format!("{}: {}", snapshot.job.id, snapshot.job.status));
    }

    /// Finaliza a barra e exibe o resultado do run.
    pub fn complete(&self, record: &AuditRecord) {
        self.pb.finish_and_clear();
        let summary = format!(
            "{} approvable, {} needs fix, {} blocked, {} pending",
            record.approvable, record.needs_fix, record.blocked, record.pending
        );
        match record.status {
            JobStatus::ReadyForQa => {
                println!("  {} {} ready for QA ({summary})", self.green.apply_to("✓"), record.job_id);
            }
            status => {
                println!(
                    "  {} {} ended {status} ({summary})",
                    self.red.apply_to("✗"),
                    record.job_id
                );
            }
        }
    }

    /// Encerra a barra com uma mensagem de erro.
    pub fn fail(&self, message: &str) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.red.apply_to("✗"));
    }
}

/// Imprime o registro de auditoria formatado em JSON com estilo colorido.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!("{}", status_style(record.status).apply_to("─── Audit Record ───"));
    println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
}

/// Tabela de lições de um job, com os erros do DoD das que falharam.
pub fn print_snapshot(snapshot: &JobSnapshot) {
    let job = &snapshot.job;
    println!(
        "{} {} [{}] {}",
        Style::new().bold().apply_to(&job.id),
        job.artifact_id,
        job.pipeline,
        status_style(job.status).apply_to(job.status)
    );
    println!("  model: {} (fallback {})", job.active_model, job.fallback_model);
    for item in &snapshot.items {
        let results = snapshot
            .results
            .iter()
            .filter(|r| r.work_item_id == item.id)
            .count();
        println!(
            "  {:<12} {:<32} iter {}/{}  results {}",
            lesson_style(item.status).apply_to(item.status),
            item.title,
            item.iteration,
            item.iteration_cap,
            results
        );
        for error in &item.dod.errors {
            println!("      {}", Style::new().red().apply_to(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::LessonPlan;

    fn item(id: &str, status: LessonStatus) -> WorkItem {
        let lesson = LessonPlan {
            id: id.into(),
            title: id.into(),
            deliverables: vec![],
        };
        let mut item = WorkItem::new("job-1", "m1", &lesson, 3);
        item.status = status;
        item
    }

    #[test]
    fn settled_skips_pending_and_in_flight() {
        let items = vec![
            item("a", LessonStatus::Approvable),
            item("b", LessonStatus::Pending),
            item("c", LessonStatus::Generating),
            item("d", LessonStatus::NeedsFix),
            item("e", LessonStatus::Blocked),
        ];
        assert_eq!(settled(&items), 3);
    }
}
