#![forbid(unsafe_code)]
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use shift_bot::{
    detect_conflicts, io, plan, prepare_reminder, ChangeEvent, Coordinator, CycleStatus,
    DeliveryChannel, Dispatcher, JsonStorage, OutboxChannel, Participant, ParticipantId, Registry,
    Role, Settings, Shift, ShiftId, Snapshot, SnapshotLock, StdoutChannel, WritePrecondition,
};
use std::sync::Arc;
#[cfg(feature = "logging")]
use tracing_subscriber::{fmt::Subscriber, EnvFilter};

/// CLI du bot de planification de créneaux
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Active les logs (feature `logging`)
    #[arg(long, global = true)]
    log: bool,

    /// Fichier JSON du snapshot
    #[arg(long, global = true, env = "SHIFTBOT_SNAPSHOT", default_value = "snapshot.json")]
    snapshot: String,

    /// Fichier JSON de réglages (relances, délais, cadence)
    #[arg(long, global = true, env = "SHIFTBOT_CONFIG")]
    config: Option<String>,

    /// Boîte d'envoi JSON lines ; sortie standard si absent
    #[arg(long, global = true)]
    outbox: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Créer un shift
    AddShift {
        #[arg(long)]
        name: String,
        /// RFC3339 UTC (ou JJ.MM.AAAA HH:MM)
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        role: String,
        #[arg(long, default_value_t = 1)]
        headcount: u32,
        #[arg(long)]
        id: Option<String>,
    },

    /// Ajouter un participant
    AddParticipant {
        #[arg(long)]
        handle: String,
        #[arg(long)]
        display_name: String,
        /// liste "role1,role2,..."
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
        #[arg(long)]
        id: Option<String>,
    },

    /// Importer des shifts depuis un CSV
    ImportShifts {
        #[arg(long)]
        csv: String,
    },

    /// Importer des participants depuis un CSV
    ImportParticipants {
        #[arg(long)]
        csv: String,
    },

    /// Déclarer une indisponibilité (`début/fin` ou date seule)
    Unavailable {
        #[arg(long)]
        handle: String,
        #[arg(long)]
        window: String,
    },

    /// Affecter manuellement (statut proposé)
    Assign {
        #[arg(long)]
        shift_id: String,
        #[arg(long)]
        handle: String,
    },

    /// Confirmer une affectation proposée
    Confirm {
        #[arg(long)]
        shift_id: String,
        #[arg(long)]
        handle: String,
        /// Commentaire joint à la notification
        #[arg(long)]
        note: Option<String>,
    },

    /// Annuler une affectation
    Cancel {
        #[arg(long)]
        shift_id: String,
        #[arg(long)]
        handle: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Lister les affectations en attente de confirmation
    Pending {
        #[arg(long)]
        handle: Option<String>,
    },

    /// Affectations récentes d'un participant
    Recent {
        #[arg(long)]
        handle: String,
        #[arg(long, default_value_t = 7)]
        days: i64,
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Transférer une affectation à une autre personne
    Swap {
        #[arg(long)]
        shift_id: String,
        #[arg(long)]
        handle: String,
        #[arg(long)]
        with: String,
    },

    /// Lister et optionnellement exporter
    List {
        #[arg(long)]
        out_json: Option<String>,
        #[arg(long)]
        out_csv: Option<String>,
    },

    /// Vérifier les conflits
    Check {
        /// Export CSV des conflits (optionnel)
        #[arg(long)]
        report: Option<String>,
    },

    /// Simuler un cycle sans rien écrire ni envoyer
    Plan {
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Exécuter un cycle complet
    Run {
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Exécuter des cycles périodiques jusqu'à Ctrl-C
    Serve {
        #[arg(long)]
        cadence_secs: Option<u64>,
    },

    /// Envoyer un rappel pour la prochaine affectation d'un participant
    Remind {
        #[arg(long)]
        handle: String,
        #[arg(long)]
        lead_hours: Option<i64>,
    },
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    Ok(io::parse_point(raw)?.0)
}

fn as_of_or_now(raw: Option<String>) -> Result<DateTime<Utc>> {
    raw.as_deref().map(parse_instant).unwrap_or_else(|| Ok(Utc::now()))
}

fn participant_id(snapshot: &Snapshot, handle: &str) -> Result<ParticipantId> {
    snapshot
        .find_participant_by_handle(handle)
        .map(|p| p.id.clone())
        .ok_or_else(|| anyhow::anyhow!("unknown participant: {handle}"))
}

/// Sauvegarde puis notifie : les messages reflètent l'état persisté.
/// Le verrou est rendu avant l'envoi.
async fn commit(
    session: SnapshotLock,
    base: u64,
    dispatcher: &Dispatcher,
    registry: Registry,
    events: Vec<ChangeEvent>,
) -> Result<()> {
    let snapshot = registry.into_snapshot();
    session
        .save(&snapshot, WritePrecondition::MatchesRevision(base))
        .await?;
    drop(session);
    for result in dispatcher.dispatch(&snapshot, &events).await {
        if !result.is_delivered() {
            eprintln!("undelivered: {} {}", result.event.label(), result.event.shift);
        }
    }
    Ok(())
}

fn print_assignment_rows(snapshot: &Snapshot, rows: &[(&Shift, &shift_bot::Assignment)]) {
    for (shift, assignment) in rows {
        let handle = snapshot
            .find_participant(&assignment.participant)
            .map_or(assignment.participant.as_str(), |p| p.handle.as_str());
        println!(
            "{} | {} | {} | {}{}",
            shift.id.as_str(),
            shift.start.to_rfc3339(),
            handle,
            assignment.status.as_str(),
            assignment
                .note
                .as_deref()
                .map(|n| format!(" | {n}"))
                .unwrap_or_default()
        );
    }
}

fn print_report(report: &shift_bot::CycleReport) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(match report.status {
        CycleStatus::Completed if report.unfilled.is_empty() && report.undelivered.is_empty() => 0,
        // Code 2 = WARNING/INCOMPLETE
        CycleStatus::Completed => 2,
        CycleStatus::Cancelled { .. } | CycleStatus::Failed { .. } => 1,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "logging")]
    if cli.log {
        let _ = Subscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    let storage = JsonStorage::open(&cli.snapshot);
    let channel: Arc<dyn DeliveryChannel> = match &cli.outbox {
        Some(path) => Arc::new(OutboxChannel::new(path)),
        None => Arc::new(StdoutChannel),
    };

    let code = match cli.cmd {
        // le coordinateur charge lui-même, avec relances
        Commands::Run { as_of } => {
            let as_of = as_of_or_now(as_of)?;
            let coordinator = Coordinator::new(Arc::new(storage), channel, &settings);
            let report = coordinator.run_cycle(as_of).await;
            print_report(&report)?
        }
        Commands::Serve { cadence_secs } => {
            if let Some(secs) = cadence_secs {
                settings.cadence_secs = secs;
            }
            settings.validate()?;
            let coordinator = Coordinator::new(Arc::new(storage), channel, &settings);
            let shutdown = coordinator.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.cancel();
                }
            });
            coordinator
                .serve(settings.cadence(), |report| {
                    if let Err(err) = print_report(report) {
                        eprintln!("report: {err}");
                    }
                })
                .await;
            0
        }
        cmd => {
            let dispatcher = Dispatcher::new(channel, settings.send_retry, settings.send_timeout());
            let session = storage
                .lock()
                .await
                .with_context(|| format!("locking {}", cli.snapshot))?;
            let snapshot = session
                .load()
                .await
                .with_context(|| format!("loading {}", cli.snapshot))?;
            let base = snapshot.revision;
            let registry = Registry::from_snapshot(snapshot)?;
            execute(cmd, session, base, registry, &dispatcher, &settings).await?
        }
    };

    std::process::exit(code);
}

/// Commandes qui lisent ou modifient le snapshot sous verrou.
async fn execute(
    cmd: Commands,
    session: SnapshotLock,
    base: u64,
    mut registry: Registry,
    dispatcher: &Dispatcher,
    settings: &Settings,
) -> Result<i32> {
    let code = match cmd {
        Commands::AddShift {
            name,
            start,
            end,
            role,
            headcount,
            id,
        } => {
            let start = parse_instant(&start)?;
            let end = parse_instant(&end)?;
            let mut shift =
                Shift::new(name, start, end, Role::new(role), headcount).map_err(anyhow::Error::msg)?;
            if let Some(id) = id {
                shift.id = ShiftId::new(id);
            }
            let id = registry.add_shift(shift)?;
            commit(session, base, dispatcher, registry, Vec::new()).await?;
            println!("{id}");
            0
        }
        Commands::AddParticipant {
            handle,
            display_name,
            roles,
            id,
        } => {
            let mut participant = Participant::new(handle, display_name);
            participant.roles = roles.iter().map(Role::new).collect();
            if let Some(id) = id {
                participant.id = ParticipantId::new(id);
            }
            let id = registry.add_participant(participant)?;
            commit(session, base, dispatcher, registry, Vec::new()).await?;
            println!("{id}");
            0
        }
        Commands::ImportShifts { csv } => {
            for shift in io::import_shifts_csv(csv)? {
                registry.add_shift(shift)?;
            }
            commit(session, base, dispatcher, registry, Vec::new()).await?;
            0
        }
        Commands::ImportParticipants { csv } => {
            for participant in io::import_participants_csv(csv)? {
                registry.add_participant(participant)?;
            }
            commit(session, base, dispatcher, registry, Vec::new()).await?;
            0
        }
        Commands::Unavailable { handle, window } => {
            let pid = participant_id(registry.snapshot(), &handle)?;
            let window = io::parse_window(&window)?;
            registry.declare_unavailable(&pid, window)?;
            commit(session, base, dispatcher, registry, Vec::new()).await?;
            0
        }
        Commands::Assign { shift_id, handle } => {
            let pid = participant_id(registry.snapshot(), &handle)?;
            let event = registry.assign(&ShiftId::new(shift_id), &pid)?;
            commit(session, base, dispatcher, registry, vec![event]).await?;
            0
        }
        Commands::Confirm {
            shift_id,
            handle,
            note,
        } => {
            let pid = participant_id(registry.snapshot(), &handle)?;
            match registry.confirm_with_note(&ShiftId::new(shift_id), &pid, note.as_deref())? {
                Some(event) => commit(session, base, dispatcher, registry, vec![event]).await?,
                None => println!("already confirmed"),
            }
            0
        }
        Commands::Cancel {
            shift_id,
            handle,
            note,
        } => {
            let pid = participant_id(registry.snapshot(), &handle)?;
            let event = registry.cancel_with_note(&ShiftId::new(shift_id), &pid, note.as_deref())?;
            commit(session, base, dispatcher, registry, vec![event]).await?;
            0
        }
        Commands::Swap {
            shift_id,
            handle,
            with,
        } => {
            let from = participant_id(registry.snapshot(), &handle)?;
            let to = participant_id(registry.snapshot(), &with)?;
            let events = registry.swap(&ShiftId::new(shift_id), &from, &to)?;
            commit(session, base, dispatcher, registry, events).await?;
            0
        }
        Commands::Pending { handle } => {
            let snapshot = registry.snapshot();
            let pid = handle
                .as_deref()
                .map(|h| participant_id(snapshot, h))
                .transpose()?;
            let rows = snapshot.pending(pid.as_ref());
            if rows.is_empty() {
                println!("nothing pending");
            }
            print_assignment_rows(snapshot, &rows);
            0
        }
        Commands::Recent {
            handle,
            days,
            as_of,
        } => {
            if days < 0 {
                anyhow::bail!("days cannot be negative");
            }
            let snapshot = registry.snapshot();
            let pid = participant_id(snapshot, &handle)?;
            let since = as_of_or_now(as_of)? - chrono::Duration::days(days);
            print_assignment_rows(snapshot, &snapshot.recent(&pid, since));
            0
        }
        Commands::List { out_json, out_csv } => {
            let snapshot = registry.snapshot();
            if let Some(path) = out_json {
                io::export_snapshot_json(path, snapshot)?;
            }
            if let Some(path) = out_csv {
                io::export_shifts_csv(path, snapshot)?;
            }
            // impression compacte
            for s in &snapshot.shifts {
                let assigned = io::describe_assignments(snapshot, &s.id);
                println!(
                    "{} | {} → {} | {} x{} | {}",
                    s.id.as_str(),
                    s.start.to_rfc3339(),
                    s.end.to_rfc3339(),
                    s.role,
                    s.headcount,
                    if assigned.is_empty() { "-" } else { assigned.as_str() }
                );
            }
            0
        }
        Commands::Check { report } => {
            let conflicts = detect_conflicts(registry.snapshot());
            if conflicts.is_empty() {
                println!("OK: no conflicts");
                0
            } else {
                eprintln!("Found {} conflict(s)", conflicts.len());
                if let Some(path) = report {
                    let mut w = csv::Writer::from_path(path)?;
                    w.write_record(["kind", "shift", "participant", "other_shift"])?;
                    for c in &conflicts {
                        w.write_record([
                            c.kind.as_str(),
                            c.shift.as_str(),
                            c.participant.as_str(),
                            c.other_shift.as_ref().map(ShiftId::as_str).unwrap_or(""),
                        ])?;
                    }
                    w.flush()?;
                }
                // Code 2 = WARNING/INCOMPLETE
                2
            }
        }
        Commands::Plan { as_of } => {
            let as_of = as_of_or_now(as_of)?;
            let (_, events) = plan(registry.snapshot(), as_of);
            println!("{}", serde_json::to_string_pretty(&events)?);
            0
        }
        Commands::Run { .. } | Commands::Serve { .. } => {
            anyhow::bail!("cycles are driven by the coordinator, not under a session")
        }
        Commands::Remind { handle, lead_hours } => {
            drop(session);
            let lead = lead_hours
                .map(chrono::Duration::hours)
                .unwrap_or_else(|| settings.reminder_lead());
            let reminder = prepare_reminder(
                registry.snapshot(),
                &handle,
                lead,
                Utc::now(),
                dispatcher.renderer(),
            )?;
            match dispatcher.deliver(&reminder.message).await {
                Ok(_) => {
                    println!(
                        "Reminder sent to {} (shift {}) for {}",
                        reminder.participant_handle,
                        reminder.shift_id,
                        reminder.notice_at.to_rfc3339()
                    );
                    0
                }
                Err((error, attempts)) => {
                    eprintln!("reminder undelivered after {attempts} attempt(s): {error}");
                    2
                }
            }
        }
    };
    Ok(code)
}
