use serde::Serialize;

use keystone_core::Ticket;

use crate::delegate::RunReport;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let line = |cells: Vec<String>| -> String {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = Vec::with_capacity(rows.len() + 2);
    out.push(line(headers.iter().map(|h| h.to_string()).collect()));
    out.push(line(widths.iter().map(|&w| "-".repeat(w)).collect()));
    for row in rows {
        out.push(line(row.clone()));
    }
    out.join("\n")
}

/// Plain text rendering of a check or update run.
pub fn render_report(report: &RunReport) -> String {
    let mut sections = Vec::new();

    if report.available.is_empty() {
        sections.push("No updates available.".to_string());
    } else {
        let rows: Vec<Vec<String>> = report
            .available
            .iter()
            .map(|u| {
                vec![
                    u.product_id.clone(),
                    u.display_version.clone().unwrap_or_else(|| "-".to_string()),
                    if u.prompt_user { "yes" } else { "no" }.to_string(),
                    u.more_info_url_for_locale("en").unwrap_or_default(),
                ]
            })
            .collect();
        sections.push(render_table(&["PRODUCT", "VERSION", "PROMPT", "MORE INFO"], &rows));
    }

    if !report.installed.is_empty() {
        let rows: Vec<Vec<String>> = report
            .installed
            .iter()
            .map(|r| {
                vec![
                    r.product_id.clone(),
                    if r.success { "installed" } else { "failed" }.to_string(),
                    if r.wants_reboot { "reboot required" } else { "" }.to_string(),
                ]
            })
            .collect();
        sections.push(render_table(&["PRODUCT", "RESULT", ""], &rows));
    }

    if report.success == Some(false) {
        sections.push("Warning: no update server could be reached.".to_string());
    }
    sections.join("\n\n")
}

/// Ticket listing. Each ticket is paired with whether it is installed.
pub fn render_tickets(tickets: &[(Ticket, bool)]) -> String {
    if tickets.is_empty() {
        return "No tickets.".to_string();
    }
    let rows: Vec<Vec<String>> = tickets
        .iter()
        .map(|(t, installed)| {
            vec![
                t.product_id().to_string(),
                t.version().to_string(),
                t.server_url().to_string(),
                t.existence_checker().describe(),
                if *installed { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    render_table(&["PRODUCT", "VERSION", "SERVER", "CHECKER", "INSTALLED"], &rows)
}
