//! Human-readable rendering of scheduler replies

use std::fmt::Write;

use uplift_core::{ActorOutcome, RunReport, RunStatus, RunSummary, WorkflowPlan};

fn outcome(outcome: &ActorOutcome) -> String {
    match outcome {
        ActorOutcome::Success => "ok".to_string(),
        ActorOutcome::SoftSkip { reason } => format!("skipped: {reason}"),
        ActorOutcome::Error { error } => format!("error: {error}"),
        ActorOutcome::Fatal { error } => format!("FATAL: {error}"),
    }
}

pub fn report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {} ({})", report.run_id, report.workflow);

    let width = report
        .actors
        .iter()
        .map(|r| r.actor.len())
        .max()
        .unwrap_or(0);
    let mut phase = "";
    for record in &report.actors {
        if record.phase != phase {
            phase = record.phase.as_str();
            let _ = writeln!(out, "  [{phase}]");
        }
        let _ = writeln!(
            out,
            "    {:width$}  {}",
            record.actor,
            outcome(&record.outcome)
        );
    }

    if !report.pending_questions.is_empty() {
        let _ = writeln!(out, "unanswered questions:");
        for question in &report.pending_questions {
            let _ = writeln!(
                out,
                "  {} ({}): {}",
                question.id, question.asked_by, question.prompt
            );
        }
    }

    if let RunStatus::Halted { inhibitors } = &report.status {
        let _ = writeln!(out, "inhibitors:");
        for inhibitor in inhibitors {
            let _ = writeln!(
                out,
                "  {} ({}): {}",
                inhibitor.title, inhibitor.producer, inhibitor.summary
            );
            if let Some(remediation) = &inhibitor.remediation {
                let _ = writeln!(out, "    remediation: {remediation}");
            }
        }
    }

    let _ = write!(out, "status: {}", report.status);
    out
}

pub fn runs(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "no runs".to_string();
    }

    let mut out = String::new();
    for run in runs {
        let _ = writeln!(
            out,
            "{}  {}  {}  {}",
            run.run_id,
            run.workflow,
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
            run.summary
        );
        if run.pending_questions > 0 {
            let _ = writeln!(out, "    {} unanswered question(s)", run.pending_questions);
        }
    }
    out.trim_end().to_string()
}

pub fn plan(plan: &WorkflowPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "workflow {} is valid", plan.workflow);

    for phase in &plan.phases {
        let mut flags = vec![format!("stage {}", phase.stage)];
        if phase.checkpoint {
            flags.push("checkpoint".to_string());
        }
        if let Some(boundary) = phase.reboot {
            flags.push(format!("reboot {boundary}"));
        }
        let _ = writeln!(out, "  {} ({})", phase.name, flags.join(", "));
        for actor in &phase.actors {
            let _ = writeln!(out, "    {actor}");
        }
    }

    if !plan.excluded.is_empty() {
        let _ = writeln!(out, "excluded: {}", plan.excluded.join(", "));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use uplift_core::{ActorRecord, Question};

    use super::*;

    #[test]
    fn test_report_groups_actors_by_phase() {
        let report = RunReport {
            run_id: "01RUN".into(),
            workflow: "ipu".into(),
            status: RunStatus::Paused {
                next_phase: Some("apply".into()),
            },
            actors: vec![
                ActorRecord {
                    actor: "scan".into(),
                    phase: "facts".into(),
                    outcome: ActorOutcome::Success,
                },
                ActorRecord {
                    actor: "check_pam".into(),
                    phase: "checks".into(),
                    outcome: ActorOutcome::SoftSkip {
                        reason: "no pam_pkcs11".into(),
                    },
                },
            ],
            pending_questions: vec![Question {
                id: "remove_pam".into(),
                prompt: "Remove?".into(),
                asked_by: "check_pam".into(),
            }],
        };

        let text = super::report(&report);

        assert!(text.starts_with("run 01RUN (ipu)\n  [facts]\n"));
        assert!(text.contains("  [checks]\n    check_pam  skipped: no pam_pkcs11"));
        assert!(text.contains("remove_pam (check_pam): Remove?"));
        assert!(text.ends_with(&format!("status: {}", report.status)));
    }

    #[test]
    fn test_empty_run_list() {
        assert_eq!(runs(&[]), "no runs");
    }
}
