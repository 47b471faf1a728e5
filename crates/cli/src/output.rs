use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};

use plenum_tickets::{JobView, StatusKind, TicketId};
use plenum_worker::WorkerRecord;

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const QUEUED: Color = Color::DarkGrey;
    const PROCESSING: Color = Color::Yellow;
    const SUCCESS: Color = Color::Green;
    const ERROR: Color = Color::Red;
    const HEADER: Color = Color::Magenta;
    const DIM: Color = Color::DarkGrey;
}

fn status_color(status: StatusKind) -> Color {
    match status {
        StatusKind::Queued => Colors::QUEUED,
        StatusKind::Processing => Colors::PROCESSING,
        StatusKind::Success => Colors::SUCCESS,
        StatusKind::Error => Colors::ERROR,
    }
}

/// Ticket ID alone on stdout, so `$(plenum submit ...)` captures it.
pub fn print_ticket(ticket: &TicketId) -> Result<()> {
    let mut stdout = io::stdout();
    writeln!(stdout, "{ticket}")?;
    Ok(())
}

/// Colored status line on stderr, full job JSON on stdout.
pub fn print_job(view: &JobView) -> Result<()> {
    let mut stderr = io::stderr();
    execute!(
        stderr,
        SetForegroundColor(status_color(view.status.status)),
        Print(format!("{} ", view.status.status)),
        SetForegroundColor(Colors::DIM),
        Print(format!(
            "{} tries={} workers={}\n",
            view.request.endpoint,
            view.status.meta.tries,
            view.status.meta.workers.join(",")
        )),
        ResetColor
    )?;

    let mut stdout = io::stdout();
    writeln!(stdout, "{}", serde_json::to_string_pretty(view)?)?;
    Ok(())
}

pub fn print_json(value: &serde_json::Value) -> Result<()> {
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub fn print_workers(workers: &[WorkerRecord], now: DateTime<Utc>) -> Result<()> {
    let mut stdout = io::stdout();
    if workers.is_empty() {
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print("No workers registered\n"),
            ResetColor
        )?;
        return Ok(());
    }

    execute!(
        stdout,
        SetForegroundColor(Colors::HEADER),
        Print(format!(
            "{:<28} {:>10} {:>10}  {}\n",
            "NAME", "AGE", "CHECK-IN", "ACTIVE TICKET"
        )),
        ResetColor
    )?;
    for worker in workers {
        let line = format!(
            "{:<28} {:>10} {:>10}  ",
            worker.name,
            format_age(now - worker.birth_time),
            format_age(now - worker.last_check_in),
        );
        execute!(stdout, Print(line))?;
        match &worker.active_ticket {
            Some(ticket) => execute!(
                stdout,
                SetForegroundColor(Colors::PROCESSING),
                Print(format!("{ticket}\n")),
                ResetColor
            )?,
            None => execute!(stdout, SetForegroundColor(Colors::DIM), Print("idle\n"), ResetColor)?,
        }
    }
    execute!(
        stdout,
        SetForegroundColor(Colors::DIM),
        Print(format!(
            "{} workers, {} busy\n",
            workers.len(),
            workers.iter().filter(|w| w.active_ticket.is_some()).count()
        )),
        ResetColor
    )?;
    Ok(())
}

pub fn print_error(message: &str) -> Result<()> {
    let mut stderr = io::stderr();
    execute!(
        stderr,
        SetForegroundColor(Colors::ERROR),
        Print(format!("Error: {message}\n")),
        ResetColor
    )?;
    Ok(())
}

/// Compact age like `42s`, `7m`, `3h`, `2d`.
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_pick_the_largest_whole_unit() {
        assert_eq!(format_age(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_age(chrono::Duration::seconds(7 * 60 + 5)), "7m");
        assert_eq!(format_age(chrono::Duration::hours(3)), "3h");
        assert_eq!(format_age(chrono::Duration::days(2)), "2d");
        assert_eq!(format_age(chrono::Duration::seconds(-5)), "0s");
    }
}
