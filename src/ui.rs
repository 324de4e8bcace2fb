//! Interface de terminal do stocksmith — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente a espera
//! por um job de lote no terminal.

use chrono::{DateTime, Utc};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::RunSummary;
use crate::store::BatchJob;

/// Indicador visual de progresso enquanto um job de lote roda no provedor.
pub struct RunProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo amarelo para notas de retentativa.
    yellow: Style,
}

impl RunProgress {
    /// Inicia o spinner com a mensagem dada e retorna a instância de progresso.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner.
    pub fn set_message(&self, message: String) {
        self.pb.set_message(message);
    }

    /// Imprime uma nota acima do spinner sem interrompê-lo.
    pub fn note(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("↻")));
    }

    /// Finaliza e limpa o spinner.
    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}

/// Imprime o resumo de uma rodada com contagens coloridas.
pub fn print_summary(summary: &RunSummary) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    println!();
    println!(
        "  collected {}, submitted {}",
        summary.collected, summary.submitted
    );
    println!("  {} {} completed", green.apply_to("✓"), summary.completed);
    if summary.rejected > 0 || summary.failed > 0 {
        println!(
            "  {} {} rejected, {} failed",
            red.apply_to("✗"),
            summary.rejected,
            summary.failed
        );
    }
    if summary.skipped > 0 {
        println!("  {} {} skipped", yellow.apply_to("-"), summary.skipped);
    }
    if summary.deferred > 0 {
        println!(
            "  {} {} deferred; rerun once quota or the provider allows",
            yellow.apply_to("↻"),
            summary.deferred
        );
    }
    if summary.pending > 0 {
        println!(
            "  {} {} still pending in active batches",
            yellow.apply_to("…"),
            summary.pending
        );
    }
}

/// Imprime os lotes ativos e o uso da quota diária.
pub fn print_status(batches: &[&BatchJob], submitted_today: u32, daily_cap: u32) {
    let bold = Style::new().bold();
    let yellow = Style::new().yellow();

    if batches.is_empty() {
        println!("no active batches");
    } else {
        println!("{}", bold.apply_to("active batches:"));
        for job in batches {
            let mut line = format!(
                "  {}  {}  {}  {}/{} files  {}",
                job.id,
                job.status,
                job.kind,
                job.file_count,
                job.batch_size_limit,
                format_age(job.created_at)
            );
            if let Some(provider_job_id) = &job.provider_job_id {
                line.push_str(&format!("  job {provider_job_id}"));
            }
            if job.poll_timeouts > 0 {
                line.push_str(&format!("  ({} wait timeouts)", job.poll_timeouts));
            }
            println!("{line}");
        }
    }

    if submitted_today >= daily_cap {
        println!(
            "submitted today: {}",
            yellow.apply_to(format!("{submitted_today}/{daily_cap} (cap reached)"))
        );
    } else {
        println!("submitted today: {submitted_today}/{daily_cap}");
    }
}

// Idade aproximada de um lote, na maior unidade inteira.
fn format_age(since: DateTime<Utc>) -> String {
    let secs = (Utc::now() - since).num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}
