#![forbid(unsafe_code)]
//! ReserveL command line: run the server or manage reservations directly
//! against the configured database.

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use reservel::config::{load_config_from, Config, DEFAULT_CONFIG_PATH};
use reservel::persistence::ListFilter;
use reservel::reservation::{AttendanceStatus, ConfirmationStatus, Reservation, ReservationStatus};
use reservel::server::{init_tracing, open_store, Server};
use reservel::service::ReservationService;
use reservel::settlement;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the HTTP API
    Serve,
    #[command(flatten)]
    Manage(ManageCommand),
}

/// Commands that work directly on the configured database.
#[derive(Subcommand)]
enum ManageCommand {
    /// Lists reservations, newest first
    List {
        #[arg(long)]
        confirmation_status: Option<ConfirmationStatus>,
        #[arg(long)]
        status: Option<ReservationStatus>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Shows a single reservation
    Show { id: String },
    /// Confirms a pending reservation
    Confirm { id: String },
    /// Cancels a confirmed reservation
    Cancel { id: String },
    /// Records attendance: not_arrived, arrived or no_show
    Attendance {
        id: String,
        status: AttendanceStatus,
    },
    /// Prints reservation statistics
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_from(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            init_tracing();
            Ok(Server::init(config)?.start().await?)
        }
        Commands::Manage(command) => manage(command, &config).await,
    }
}

async fn manage(
    command: ManageCommand,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = offline_service(config)?;
    match command {
        ManageCommand::List {
            confirmation_status,
            status,
            limit,
        } => {
            let filter = ListFilter {
                confirmation_status,
                status,
                limit: Some(limit),
                ..Default::default()
            };
            let reservations = service.list(&filter)?;
            if reservations.is_empty() {
                println!("{}", "No reservations found".yellow());
            } else {
                println!("{}", reservation_table(&reservations));
            }
        }
        ManageCommand::Show { id } => print_details(&service.get(&id)?),
        ManageCommand::Confirm { id } => {
            let r = service.confirm_pending(&id)?;
            println!("{} {}", "✅ Confirmed".green().bold(), r.reservation_id);
        }
        ManageCommand::Cancel { id } => {
            let r = service.cancel_confirmed(&id)?;
            println!("{} {}", "🚫 Cancelled".red().bold(), r.reservation_id);
        }
        ManageCommand::Attendance { id, status } => {
            let outcome = service.update_attendance(&id, status).await?;
            println!(
                "{} {} → {}",
                "📋 Attendance".cyan().bold(),
                outcome.reservation.reservation_id,
                outcome.reservation.attendance_status
            );
            if let Some(err) = outcome.settlement_error {
                println!("{} {}", "⚠️  Settlement:".yellow(), err);
            }
        }
        ManageCommand::Stats => {
            let stats = service.stats()?;
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec![
                    Cell::new("Metric")
                        .fg(TableColor::Cyan)
                        .add_attribute(Attribute::Bold),
                    Cell::new("Count")
                        .fg(TableColor::Cyan)
                        .add_attribute(Attribute::Bold),
                ]);
            for (label, value) in [
                ("Total", stats.total as u64),
                ("Pending", stats.pending as u64),
                ("Confirmed", stats.confirmed as u64),
                ("Cancelled", stats.cancelled as u64),
                ("Completed", stats.completed as u64),
                ("Arrived", stats.arrived as u64),
                ("No-show", stats.no_show as u64),
                ("Total guests", stats.total_guests),
                ("Expected guests", stats.expected_guests),
                ("Today", stats.today as u64),
            ] {
                table.add_row(vec![Cell::new(label), Cell::new(value)]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

/// Service over the configured database, without the SQLite fallback: a
/// command that cannot reach the real data should fail loudly.
fn offline_service(config: &Config) -> Result<ReservationService, Box<dyn std::error::Error>> {
    let (store, storage) = open_store(&config.database.path);
    if storage != "sqlite" {
        return Err(format!("Cannot open database at {}", config.database.path).into());
    }
    let settlement = settlement::from_config(&config.settlement)?;
    Ok(ReservationService::new(
        store,
        settlement,
        config.server.public_url.clone(),
    ))
}

fn status_color(status: ReservationStatus) -> TableColor {
    match status {
        ReservationStatus::Pending => TableColor::Yellow,
        ReservationStatus::Confirmed => TableColor::Green,
        ReservationStatus::Cancelled => TableColor::Red,
        ReservationStatus::Completed => TableColor::Blue,
    }
}

fn reservation_table(reservations: &[Reservation]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            ["ID", "Business", "Customer", "When", "People", "Status", "Attendance"]
                .into_iter()
                .map(|h| {
                    Cell::new(h)
                        .fg(TableColor::Cyan)
                        .add_attribute(Attribute::Bold)
                }),
        );

    for r in reservations {
        table.add_row(vec![
            Cell::new(&r.reservation_id).fg(TableColor::White),
            Cell::new(&r.business_name),
            Cell::new(&r.customer_name),
            Cell::new(format!("{} {}", r.date, r.time)),
            Cell::new(r.number_of_people),
            Cell::new(r.status).fg(status_color(r.status)),
            Cell::new(r.attendance_status),
        ]);
    }
    table
}

fn print_details(r: &Reservation) {
    println!("{}", format!("📍 {}", r.reservation_id).bright_cyan().bold());
    println!("   Business:      {}", r.business_name);
    println!("   Customer:      {} ({})", r.customer_name, r.customer_phone);
    println!("   When:          {} {}", r.date, r.time);
    println!("   People:        {}", r.number_of_people);
    println!("   Status:        {}", r.status.to_string().bold());
    println!("   Confirmation:  {}", r.confirmation_status);
    println!("   Attendance:    {}", r.attendance_status);
    println!("   Payment:       {}", r.payment_status);
    if let Some(notes) = &r.notes {
        println!("   Notes:         {}", notes.italic());
    }
    if let Some(chain_id) = &r.blockchain_reservation_id {
        println!("   Chain id:      {}", chain_id);
    }
    if let Some(tx) = &r.transaction_hash {
        println!("   Last tx:       {}", tx.dimmed());
    }
}
