//! Timegate CLI - command-line client for the timegate daemon
//!
//! # Usage
//!
//! ```bash
//! # Track a domain with a one hour daily limit
//! timegate add example.com --daily 1h
//!
//! # See where the time went
//! timegate list
//! timegate info example.com
//!
//! # Grant yourself 30 more minutes on a blocked domain
//! timegate extend example.com --duration 30m --reason "deadline"
//!
//! # Stream enforcement directives as they happen
//! timegate watch
//!
//! # Talk to a daemon on a custom socket
//! TIMEGATE_SOCKET=/run/timegate.sock timegate list
//! ```

mod client;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use timegate_core::{format_duration, Millis, HOUR_MS, MINUTE_MS, SECOND_MS};
use timegate_protocol::{Action, DaemonReply, DomainUpdates, SettingsUpdate};

use client::{resolve_socket_path, DaemonClient};

/// Timegate - per-domain browsing time limits
#[derive(Parser, Debug)]
#[command(name = "timegate", version, about)]
struct Args {
    /// Unix socket path (overrides TIMEGATE_SOCKET)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Print raw JSON replies instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the currently tracked session
    Status,

    /// List all tracked domains
    List,

    /// Track a domain with optional limits
    Add {
        domain: String,

        /// Daily limit, e.g. 1h, 90m, 45m30s
        #[arg(long, value_parser = parse_duration)]
        daily: Option<Millis>,

        /// Weekly limit
        #[arg(long, value_parser = parse_duration)]
        weekly: Option<Millis>,
    },

    /// Change a tracked domain's limits ("none" clears a limit)
    Update {
        domain: String,

        #[arg(long, value_parser = parse_limit)]
        daily: Option<Option<Millis>>,

        #[arg(long, value_parser = parse_limit)]
        weekly: Option<Option<Millis>>,
    },

    /// Stop tracking a domain and drop its records
    Remove { domain: String },

    /// Show one domain's record, extensions, and remaining quota
    Info { domain: String },

    /// Evaluate a domain's current block state
    Check { domain: String },

    /// Request a temporary blocking extension
    Extend {
        domain: String,

        /// Extension length; the settings default applies when absent
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Millis>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Manage domains exempt from tracking
    #[command(subcommand)]
    Exclude(ExcludeCommand),

    /// Show or change settings
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Print the full state as JSON
    Export,

    /// Load state from a JSON snapshot file
    Import { file: PathBuf },

    /// Clear all data and restore defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Force the weekly reset procedure now
    WeeklyReset,

    /// Freeze session accounting without destroying the session
    Pause,

    /// Resume session accounting
    Resume,

    /// Check the daemon is alive
    Ping,

    /// Stream enforcement directives as they are pushed
    Watch,
}

#[derive(Subcommand, Debug)]
enum ExcludeCommand {
    /// Exempt a domain from tracking
    Add { domain: String },
    /// Remove an exemption
    Remove { domain: String },
    /// List exempt domains
    List,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Show current settings
    Show,
    /// Change settings fields
    Set {
        #[arg(long)]
        tracking: Option<bool>,

        #[arg(long)]
        notifications: Option<bool>,

        #[arg(long)]
        max_weekly_extensions: Option<u32>,

        #[arg(long, value_parser = parse_duration)]
        default_extension_duration: Option<Millis>,

        /// 0 = Sunday .. 6 = Saturday
        #[arg(long)]
        week_start_day: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let socket_path = resolve_socket_path(args.socket.clone());

    if let Command::Watch = args.command {
        let client = DaemonClient::connect(&socket_path).await?;
        eprintln!("Watching for directives (Ctrl-C to stop)...");
        return client
            .watch(|reply| {
                print_json(&reply);
                Ok(())
            })
            .await;
    }

    let mut client = DaemonClient::connect(&socket_path).await?;
    let action = build_action(&args.command)?;
    let reply = client.request(action).await?;

    if args.json {
        print_json(&reply);
        return finish(&reply);
    }

    print_reply(&reply);
    finish(&reply)
}

/// Maps a CLI command to its wire action.
fn build_action(command: &Command) -> Result<Action> {
    let action = match command {
        Command::Status => Action::GetCurrentSession,
        Command::List => Action::GetAllDomains,
        Command::Add {
            domain,
            daily,
            weekly,
        } => Action::AddDomain {
            domain: domain.clone(),
            daily_limit: *daily,
            weekly_limit: *weekly,
        },
        Command::Update {
            domain,
            daily,
            weekly,
        } => {
            if daily.is_none() && weekly.is_none() {
                bail!("Nothing to update: pass --daily and/or --weekly");
            }
            Action::UpdateDomain {
                domain: domain.clone(),
                updates: DomainUpdates {
                    daily_limit: *daily,
                    weekly_limit: *weekly,
                },
            }
        }
        Command::Remove { domain } => Action::DeleteDomain {
            domain: domain.clone(),
        },
        Command::Info { domain } => Action::GetDomainInfo {
            domain: domain.clone(),
        },
        Command::Check { domain } => Action::CheckBlockStatus {
            domain: domain.clone(),
        },
        Command::Extend {
            domain,
            duration,
            reason,
        } => Action::RequestExtension {
            domain: domain.clone(),
            duration: *duration,
            reason: reason.clone(),
        },
        Command::Exclude(ExcludeCommand::Add { domain }) => Action::AddExcludedDomain {
            domain: domain.clone(),
        },
        Command::Exclude(ExcludeCommand::Remove { domain }) => Action::RemoveExcludedDomain {
            domain: domain.clone(),
        },
        Command::Exclude(ExcludeCommand::List) => Action::GetExcludedDomains,
        Command::Settings(SettingsCommand::Show) => Action::GetSettings,
        Command::Settings(SettingsCommand::Set {
            tracking,
            notifications,
            max_weekly_extensions,
            default_extension_duration,
            week_start_day,
        }) => Action::UpdateSettings {
            settings: SettingsUpdate {
                tracking_enabled: *tracking,
                notifications_enabled: *notifications,
                max_weekly_extensions: *max_weekly_extensions,
                max_daily_extensions: None,
                default_extension_duration: *default_extension_duration,
                week_start_day: *week_start_day,
                idle_threshold_seconds: None,
            },
        },
        Command::Export => Action::ExportData,
        Command::Import { file } => {
            let contents = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let data: serde_json::Value =
                serde_json::from_str(&contents).context("Snapshot is not valid JSON")?;
            Action::ImportData { data }
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("This erases all tracked time and settings. Re-run with --yes to confirm.");
            }
            Action::ResetData
        }
        Command::WeeklyReset => Action::ManualWeeklyReset,
        Command::Pause => Action::PauseTracking,
        Command::Resume => Action::ResumeTracking,
        Command::Ping => Action::Ping { seq: 0 },
        Command::Watch => bail!("watch is handled before dispatch"),
    };
    Ok(action)
}

/// Formats a reply for humans.
fn print_reply(reply: &DaemonReply) {
    match reply {
        DaemonReply::Ok => println!("ok"),

        DaemonReply::Pong { .. } => println!("daemon is alive"),

        DaemonReply::CurrentSession { session: None } => println!("No session is being tracked."),
        DaemonReply::CurrentSession {
            session: Some(session),
        } => {
            let state = if session.paused { " (paused)" } else { "" };
            println!("Tracking {} in tab {}{}", session.domain, session.tab_id, state);
        }

        DaemonReply::DomainList { domains } if domains.is_empty() => {
            println!("No domains are tracked.");
        }
        DaemonReply::DomainList { domains } => {
            for (domain, record) in domains {
                let daily = limit_display(record.daily_time, record.daily_limit);
                let weekly = limit_display(record.weekly_time, record.weekly_limit);
                let blocked = if record.is_blocked { "  [BLOCKED]" } else { "" };
                println!("{domain}\n  today: {daily}\n  week:  {weekly}{blocked}");
            }
        }

        DaemonReply::DomainRecord { domain, record } => {
            println!(
                "{domain}: daily limit {}, weekly limit {}",
                record
                    .daily_limit
                    .map_or("none".to_string(), |l| format_duration(l, false)),
                record
                    .weekly_limit
                    .map_or("none".to_string(), |l| format_duration(l, false)),
            );
        }

        DaemonReply::DomainInfo {
            domain,
            record,
            active_extension,
            remaining_extensions,
            ..
        } => {
            println!("{domain}");
            println!("  today:    {}", limit_display(record.daily_time, record.daily_limit));
            println!("  week:     {}", limit_display(record.weekly_time, record.weekly_limit));
            println!("  lifetime: {}", format_duration(record.total_time, false));
            println!("  blocked:  {}", record.is_blocked);
            match active_extension {
                Some(ext) => println!("  extension: active, {} granted", format_duration(ext.duration, false)),
                None => println!("  extension: none"),
            }
            println!("  extensions left this week: {remaining_extensions}");
        }

        DaemonReply::BlockStatus { decision, .. } => match decision.reason() {
            Some(reason) => println!("{reason}"),
            None if decision.is_blocked() => println!("blocked"),
            None => println!("allowed"),
        },

        DaemonReply::ExtensionGranted {
            extension,
            remaining_extensions,
        } => {
            println!(
                "Extension granted for {} ({} left this week)",
                format_duration(extension.duration, false),
                remaining_extensions
            );
        }

        DaemonReply::ExcludedDomains { domains } if domains.is_empty() => {
            println!("No domains are excluded.");
        }
        DaemonReply::ExcludedDomains { domains } => {
            for domain in domains {
                println!("{domain}");
            }
        }

        DaemonReply::Settings { settings } => {
            println!("tracking:                   {}", settings.tracking_enabled);
            println!("notifications:              {}", settings.notifications_enabled);
            println!("max weekly extensions:      {}", settings.max_weekly_extensions);
            println!(
                "default extension duration: {}",
                format_duration(settings.default_extension_duration, false)
            );
            println!("week starts on day:         {}", settings.week_start_day);
        }

        DaemonReply::ExportedData { data } => match serde_json::to_string_pretty(data) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{data}"),
        },

        DaemonReply::Error { message, .. } => eprintln!("error: {message}"),

        // Handshake and push replies don't reach one-shot commands
        other => print_json(other),
    }
}

/// Usage-vs-limit column, e.g. "42m / 1h".
fn limit_display(used: Millis, limit: Option<Millis>) -> String {
    match limit {
        Some(limit) => format!("{} / {}", format_duration(used, true), format_duration(limit, true)),
        None => format!("{} (no limit)", format_duration(used, true)),
    }
}

fn print_json(reply: &DaemonReply) {
    match serde_json::to_string_pretty(reply) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("error: failed to render reply: {e}"),
    }
}

/// Error replies exit nonzero so scripts can branch on them. The
/// message was already printed by the output path.
fn finish(reply: &DaemonReply) -> Result<()> {
    if matches!(reply, DaemonReply::Error { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

/// Parses durations like "1h", "90m", "45m30s", or "1h30m".
fn parse_duration(s: &str) -> Result<Millis, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total: Millis = 0;
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: Millis = digits
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        digits.clear();
        total += match ch {
            'h' => value * HOUR_MS,
            'm' => value * MINUTE_MS,
            's' => value * SECOND_MS,
            _ => return Err(format!("unknown duration unit '{ch}' in {s}")),
        };
    }

    if !digits.is_empty() {
        // Bare number defaults to minutes
        let value: Millis = digits
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        total += value * MINUTE_MS;
    }

    if total <= 0 {
        return Err("duration must be positive".to_string());
    }
    Ok(total)
}

/// Parses a limit: a duration, or "none" to clear it.
fn parse_limit(s: &str) -> Result<Option<Millis>, String> {
    if s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_duration(s).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1h"), Ok(HOUR_MS));
        assert_eq!(parse_duration("90m"), Ok(90 * MINUTE_MS));
        assert_eq!(parse_duration("1h30m"), Ok(HOUR_MS + 30 * MINUTE_MS));
        assert_eq!(parse_duration("45m30s"), Ok(45 * MINUTE_MS + 30 * SECOND_MS));
    }

    #[test]
    fn test_parse_duration_bare_number_is_minutes() {
        assert_eq!(parse_duration("30"), Ok(30 * MINUTE_MS));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("1x").is_err());
        assert!(parse_duration("0m").is_err());
    }

    #[test]
    fn test_parse_limit_none_clears() {
        assert_eq!(parse_limit("none"), Ok(None));
        assert_eq!(parse_limit("NONE"), Ok(None));
        assert_eq!(parse_limit("1h"), Ok(Some(HOUR_MS)));
    }

    #[test]
    fn test_update_requires_a_field() {
        let cmd = Command::Update {
            domain: "example.com".to_string(),
            daily: None,
            weekly: None,
        };
        assert!(build_action(&cmd).is_err());
    }

    #[test]
    fn test_reset_requires_confirmation() {
        assert!(build_action(&Command::Reset { yes: false }).is_err());
        assert!(build_action(&Command::Reset { yes: true }).is_ok());
    }
}
